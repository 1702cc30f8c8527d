//! Conversion of hand-written tool invocations (`CustomBuild` items running the
//! code generators) into typed tool items.
//!
//! For every tool, custom builds are first grouped by the file they actually
//! process, so that several declarations for one input collapse into a single
//! item. Each configuration's command line is then templated (file, configuration
//! and platform names become macros), parsed into item properties, and the
//! per-configuration property sets are merged: values shared by every
//! configuration are written once, the rest keep a configuration condition.
//!
//! A command that does not match the expected invocation pattern leaves its item
//! untouched and is reported as a [`ConversionIssue`]; the other items still convert.

use super::modules::{file_name, split_list};
use super::project::{MsBuildProject, ProjectConfiguration, config_condition};
use super::steps::StepResult;
use super::SchemaMigrator;
use crate::models::settings::generated_dir;
use crate::models::{ConversionIssue, SettingsStore, TreeNode};
use camino::Utf8Path;
use indexmap::{IndexMap, IndexSet};
use regex::{NoExpand, Regex, RegexBuilder};
use std::collections::HashMap;

/// Code generator invoked by legacy custom build steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Moc,
    Rcc,
    Repc,
    Uic,
}

impl ToolKind {
    /// Conversion order.
    pub const ALL: [ToolKind; 4] = [ToolKind::Moc, ToolKind::Rcc, ToolKind::Repc, ToolKind::Uic];

    pub fn exe(self) -> &'static str {
        match self {
            ToolKind::Moc => "moc.exe",
            ToolKind::Rcc => "rcc.exe",
            ToolKind::Repc => "repc.exe",
            ToolKind::Uic => "uic.exe",
        }
    }

    pub fn item_type(self) -> &'static str {
        match self {
            ToolKind::Moc => "QtMoc",
            ToolKind::Rcc => "QtRcc",
            ToolKind::Repc => "QtRepc",
            ToolKind::Uic => "QtUic",
        }
    }

    fn description(self) -> &'static str {
        match self {
            ToolKind::Moc => "Moc'ing %(Identity)...",
            ToolKind::Rcc => "Rcc'ing %(Identity)...",
            ToolKind::Repc => "Repc'ing %(Identity)...",
            ToolKind::Uic => "Uic'ing %(Identity)...",
        }
    }

    /// Generated file name patterns, as (fixed name, templated name).
    fn generated_names(self, stem: &str) -> Vec<(String, &'static str)> {
        match self {
            ToolKind::Moc => vec![
                (format!("moc_{}.cpp", stem), "moc_%(Filename).cpp"),
                (format!("{}.moc", stem), "%(Filename).moc"),
            ],
            ToolKind::Rcc => vec![(format!("qrc_{}.cpp", stem), "qrc_%(Filename).cpp")],
            ToolKind::Uic => vec![(format!("ui_{}.h", stem), "ui_%(Filename).h")],
            ToolKind::Repc => Vec::new(),
        }
    }

    fn options(self) -> &'static [OptionSpec] {
        match self {
            ToolKind::Moc => MOC_OPTIONS,
            ToolKind::Rcc => RCC_OPTIONS,
            ToolKind::Repc => REPC_OPTIONS,
            ToolKind::Uic => UIC_OPTIONS,
        }
    }

    /// Positional arguments after the input file that name the output.
    fn output_positional(self) -> bool {
        self == ToolKind::Repc
    }
}

#[derive(Debug, Clone, Copy)]
enum OptionArg {
    /// Sets the property to `true`.
    Flag(&'static str),
    /// Takes one value.
    Value(&'static str),
    /// Takes one value, appended to a `;` list.
    List(&'static str),
    /// Output file, split into `<tool>Dir` and `<tool>FileName`.
    Output,
}

#[derive(Debug, Clone, Copy)]
struct OptionSpec {
    names: &'static [&'static str],
    /// Value may be glued to the option name (`-DNAME`).
    attached: bool,
    arg: OptionArg,
}

const fn opt(names: &'static [&'static str], attached: bool, arg: OptionArg) -> OptionSpec {
    OptionSpec {
        names,
        attached,
        arg,
    }
}

const MOC_OPTIONS: &[OptionSpec] = &[
    opt(&["-o"], true, OptionArg::Output),
    opt(&["-I"], true, OptionArg::List("IncludePath")),
    opt(&["-D"], true, OptionArg::List("Define")),
    opt(&["-U"], true, OptionArg::List("Undefine")),
    opt(&["-f"], true, OptionArg::Value("ForceInclude")),
    opt(&["-b"], true, OptionArg::List("PrependInclude")),
    opt(&["-M"], true, OptionArg::List("Metadata")),
    opt(&["-p"], false, OptionArg::Value("PathPrefix")),
    opt(&["-i"], false, OptionArg::Flag("NoInclude")),
    opt(&["-nw", "--no-warnings"], false, OptionArg::Flag("NoWarnings")),
    opt(&["-nn", "--no-notes"], false, OptionArg::Flag("NoNotes")),
    opt(&["-E"], false, OptionArg::Flag("PreprocessOnly")),
    opt(&["--compiler-flavor"], false, OptionArg::Value("CompilerFlavor")),
];

const RCC_OPTIONS: &[OptionSpec] = &[
    opt(&["-o"], false, OptionArg::Output),
    opt(&["-name"], false, OptionArg::Value("InitFuncName")),
    opt(&["-threshold"], false, OptionArg::Value("CompressThreshold")),
    opt(&["-compress"], false, OptionArg::Value("Compression")),
    opt(&["-no-compress"], false, OptionArg::Flag("NoCompression")),
    opt(&["-root"], false, OptionArg::Value("Root")),
    opt(&["-binary"], false, OptionArg::Flag("BinaryOutput")),
];

const UIC_OPTIONS: &[OptionSpec] = &[
    opt(&["-o"], false, OptionArg::Output),
    opt(&["-tr", "--tr"], false, OptionArg::Value("TrFunction")),
    opt(&["-g", "--generator"], false, OptionArg::Value("Generator")),
    opt(&["-p", "--no-protection"], false, OptionArg::Flag("NoProtection")),
    opt(&["-a", "--no-autoconnection"], false, OptionArg::Flag("NoAutoConnection")),
    opt(&["--no-implicit-includes"], false, OptionArg::Flag("NoImplicitIncludes")),
];

const REPC_OPTIONS: &[OptionSpec] = &[
    opt(&["-i"], false, OptionArg::Value("InputFileType")),
    opt(&["-o"], false, OptionArg::Value("OutputFileType")),
    opt(&["-I"], true, OptionArg::List("IncludePath")),
];

const SOURCE_EXTENSIONS: &[&str] = &["c", "cpp", "cxx", "cc", "c++"];

/// Case-insensitive literal replacement.
fn replace_ignore_case(haystack: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    match RegexBuilder::new(&regex::escape(needle))
        .case_insensitive(true)
        .build()
    {
        Ok(re) => re.replace_all(haystack, NoExpand(replacement)).into_owned(),
        Err(_) => haystack.to_string(),
    }
}

/// Comparable form of a project-relative path.
fn normalize_path(path: &str) -> String {
    let mut path = path.trim().replace('/', "\\").to_ascii_lowercase();
    loop {
        if let Some(rest) = path.strip_prefix(".\\") {
            path = rest.to_string();
        } else if let Some(rest) = path.strip_prefix('\\') {
            path = rest.to_string();
        } else {
            return path;
        }
    }
}

fn split_file_name(path: &str) -> (&str, &str) {
    let name = file_name(path);
    let dir = path[..path.len() - name.len()].trim_end_matches(['\\', '/']);
    (dir, name)
}

fn stem_and_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    }
}

fn is_source_file(path: &str) -> bool {
    let (_, ext) = stem_and_extension(file_name(path));
    let ext = ext.trim_start_matches('.');
    SOURCE_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(ext))
}

/// Stand-in for the build system's macro expansion, for one item and configuration.
struct MacroContext<'a> {
    config: &'a ProjectConfiguration,
    include: &'a str,
}

impl MacroContext<'_> {
    fn expand(&self, text: &str) -> String {
        let (dir, name) = split_file_name(self.include);
        let (stem, ext) = stem_and_extension(name);
        let dir = if dir.is_empty() {
            String::new()
        } else {
            format!("{}\\", dir)
        };
        let mut replacements: Vec<(String, String)> = vec![
            ("$(ConfigurationName)".into(), self.config.configuration.clone()),
            ("$(Configuration)".into(), self.config.configuration.clone()),
            ("$(PlatformName)".into(), self.config.platform.clone()),
            ("$(Platform)".into(), self.config.platform.clone()),
            ("$(ProjectDir)".into(), String::new()),
            ("$(InputPath)".into(), self.include.to_string()),
            ("%(FullPath)".into(), self.include.to_string()),
            ("%(Identity)".into(), self.include.to_string()),
            ("$(InputFileName)".into(), name.to_string()),
            ("$(InputName)".into(), stem.to_string()),
            ("%(Filename)".into(), stem.to_string()),
            ("%(Extension)".into(), ext.to_string()),
            ("$(InputDir)".into(), dir.clone()),
            ("%(RelativeDir)".into(), dir),
        ];
        replacements.extend(
            self.config
                .properties
                .iter()
                .map(|(name, value)| (format!("$({})", name), value.clone())),
        );
        replacements
            .iter()
            .fold(text.to_string(), |text, (from, to)| {
                replace_ignore_case(&text, from, to)
            })
    }
}

/// Properties parsed from one command line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub input: String,
    pub properties: IndexMap<String, String>,
}

/// Split a command line into arguments, honoring double quotes.
fn tokenize(command: &str) -> Result<Vec<String>, String> {
    let lines = command.lines().filter(|l| !l.trim().is_empty()).count();
    if lines > 1 {
        return Err("command line runs more than one command".to_string());
    }
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for c in command.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            '&' | '|' if !quoted => {
                return Err("command line runs more than one command".to_string());
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if quoted {
        return Err("unbalanced quotes in command line".to_string());
    }
    if pending {
        tokens.push(current);
    }
    Ok(tokens)
}

fn set_output(tool: ToolKind, properties: &mut IndexMap<String, String>, output: &str) {
    let (dir, name) = split_file_name(output);
    let dir = if dir.is_empty() { "$(ProjectDir)" } else { dir };
    properties.insert(format!("{}Dir", tool.item_type()), dir.to_string());
    properties.insert(format!("{}FileName", tool.item_type()), name.to_string());
}

/// Parse a tool invocation into item properties.
pub fn parse_command(tool: ToolKind, command: &str) -> Result<ParsedCommand, String> {
    let tokens = tokenize(command)?;
    let mut tokens = tokens.into_iter();
    let program = tokens.next().ok_or_else(|| "empty command line".to_string())?;
    if !program.to_ascii_lowercase().ends_with(tool.exe()) {
        return Err(format!("expected '{}', found '{}'", tool.exe(), program));
    }

    let mut parsed = ParsedCommand::default();
    let mut positionals = Vec::new();
    while let Some(token) = tokens.next() {
        if token.len() < 2 || !token.starts_with('-') {
            positionals.push(token);
            continue;
        }
        let exact = tool
            .options()
            .iter()
            .find(|option| option.names.contains(&token.as_str()));
        let (option, value) = match exact {
            Some(option) => (option, None),
            None => {
                let attached = tool.options().iter().find_map(|option| {
                    let name = option
                        .names
                        .iter()
                        .find(|n| option.attached && token.starts_with(**n))?;
                    Some((option, token[name.len()..].to_string()))
                });
                match attached {
                    Some((option, value)) => (option, Some(value)),
                    None => return Err(format!("unknown option '{}'", token)),
                }
            }
        };
        let mut take_value = || {
            value
                .clone()
                .or_else(|| tokens.next())
                .ok_or_else(|| format!("missing value for option '{}'", token))
        };
        match option.arg {
            OptionArg::Flag(property) => {
                parsed.properties.insert(property.to_string(), "true".to_string());
            }
            OptionArg::Value(property) => {
                let value = take_value()?;
                parsed.properties.insert(property.to_string(), value);
            }
            OptionArg::List(property) => {
                let value = take_value()?;
                parsed
                    .properties
                    .entry(property.to_string())
                    .and_modify(|list| {
                        list.push(';');
                        list.push_str(&value);
                    })
                    .or_insert(value);
            }
            OptionArg::Output => {
                let value = take_value()?;
                set_output(tool, &mut parsed.properties, &value);
            }
        }
    }

    let mut positionals = positionals.into_iter();
    parsed.input = positionals
        .next()
        .ok_or_else(|| "missing input file".to_string())?;
    if tool.output_positional() {
        if let Some(output) = positionals.next() {
            set_output(tool, &mut parsed.properties, &output);
        }
    }
    if let Some(extra) = positionals.next() {
        return Err(format!("unexpected argument '{}'", extra));
    }
    Ok(parsed)
}

/// Replace fixed names in a command with macros.
fn template_command(
    tool: ToolKind,
    include: &str,
    command: &str,
    config: &ProjectConfiguration,
) -> String {
    let name = file_name(include);
    let (stem, _) = stem_and_extension(name);
    let mut command = replace_ignore_case(command, name, "%(Filename)%(Extension)");
    for (fixed, templated) in tool.generated_names(stem) {
        command = replace_ignore_case(&command, &format!("\\{}", fixed), &format!("\\{}", templated));
        command = replace_ignore_case(
            &command,
            &format!(" -o {}", fixed),
            &format!(" -o $(ProjectDir)\\{}", templated),
        );
    }
    for (name, macro_name) in [
        (&config.configuration, "$(Configuration)"),
        (&config.platform, "$(Platform)"),
    ] {
        if name.is_empty() {
            continue;
        }
        let pattern = format!(r"(?i)\b{}\b", regex::escape(name));
        if let Ok(re) = Regex::new(&pattern) {
            command = re.replace_all(&command, NoExpand(macro_name)).into_owned();
        }
    }
    command
}

fn is_tool_build(tool: ToolKind, node: &TreeNode) -> bool {
    node.name == "CustomBuild"
        && node
            .children_named("Command")
            .any(|c| c.value().to_ascii_lowercase().contains(tool.exe()))
}

/// Value of `name` for a configuration: the conditioned element, else the unconditioned one.
fn config_child<'a>(
    item: &'a TreeNode,
    name: &'a str,
    config: &ProjectConfiguration,
) -> Option<&'a TreeNode> {
    let condition = config.condition();
    item.children_named(name)
        .find(|c| c.attr("Condition") == Some(condition.as_str()))
        .or_else(|| item.children_named(name).find(|c| c.attr("Condition").is_none()))
}

fn is_excluded(item: &TreeNode, condition: Option<&str>) -> bool {
    item.children_named("ExcludedFromBuild")
        .any(|e| e.attr("Condition") == condition && e.value().eq_ignore_ascii_case("true"))
}

/// Placeholder configuration for projects that declare none.
fn default_configuration() -> ProjectConfiguration {
    ProjectConfiguration {
        id: String::new(),
        configuration: String::new(),
        platform: String::new(),
        properties: Vec::new(),
    }
}

/// The file a custom build actually processes.
///
/// `.moc` and `.cbt` placeholder items name the generated file; their input is
/// read from the command line. Everything else processes its own `Include`.
fn effective_input(tool: ToolKind, item: &TreeNode, configs: &[ProjectConfiguration]) -> String {
    let include = item.attr("Include").unwrap_or_default();
    let lower = include.to_ascii_lowercase();
    if !(lower.ends_with(".moc") || lower.ends_with(".cbt")) {
        return include.to_string();
    }
    let fallback = default_configuration();
    let config = configs.first().unwrap_or(&fallback);
    let Some(command) = item.child("Command") else {
        return include.to_string();
    };
    match parse_command(tool, command.value()) {
        Ok(parsed) => MacroContext { config, include }.expand(&parsed.input),
        Err(_) => include.to_string(),
    }
}

const MERGED_PROPERTIES: &[&str] = &["AdditionalInputs", "Command", "Message", "Outputs"];

/// Collapse custom builds that process the same input into one item.
fn merge_by_input(
    tool: ToolKind,
    root: &mut TreeNode,
    filters: Option<&mut TreeNode>,
    configs: &[ProjectConfiguration],
) {
    // key -> (display input, entries as (group, index))
    let mut groups: IndexMap<String, (String, Vec<(usize, usize)>)> = IndexMap::new();
    for (g, group) in root.children.iter().enumerate() {
        if group.name != "ItemGroup" {
            continue;
        }
        for (i, item) in group.children.iter().enumerate() {
            if !is_tool_build(tool, item) {
                continue;
            }
            let input = effective_input(tool, item, configs);
            groups
                .entry(normalize_path(&input))
                .or_insert_with(|| (input, Vec::new()))
                .1
                .push((g, i));
        }
    }

    let mut edits: HashMap<(usize, usize), Option<TreeNode>> = HashMap::new();
    let mut replaced_inputs = Vec::new();
    let mut removed_includes = Vec::new();
    for (key, (input, entries)) in &groups {
        let placeholder = entries.iter().any(|&(g, i)| {
            normalize_path(root.children[g].children[i].attr("Include").unwrap_or_default()) != *key
        });
        if entries.len() < 2 && !placeholder {
            continue;
        }
        let mut merged = TreeNode::element("CustomBuild").with_attr("Include", input.clone());
        if placeholder {
            merged.children.push(TreeNode::element("FileType").with_text("Document"));
        }
        for &(g, i) in entries {
            let item = &root.children[g].children[i];
            merged.children.extend(
                item.children
                    .iter()
                    .filter(|p| MERGED_PROPERTIES.contains(&p.name.as_str()))
                    .filter(|p| !is_excluded(item, p.attr("Condition")))
                    .cloned(),
            );
            let include = item.attr("Include").unwrap_or_default().to_string();
            if normalize_path(&include) != *key {
                removed_includes.push(include);
            }
            edits.insert((g, i), None);
        }
        // The merged item takes the place of the first declaration
        if let Some(&(g, i)) = entries.first() {
            edits.insert((g, i), Some(merged));
        }
        if placeholder {
            replaced_inputs.push(key.clone());
        }
        tracing::debug!(
            "Merged {} {} declaration(s) for input '{}'",
            entries.len(),
            tool.exe(),
            input
        );
    }
    if edits.is_empty() {
        return;
    }

    for (g, group) in root.children.iter_mut().enumerate() {
        if group.name != "ItemGroup" {
            continue;
        }
        let children = std::mem::take(&mut group.children);
        for (i, child) in children.into_iter().enumerate() {
            match edits.remove(&(g, i)) {
                Some(Some(merged)) => group.children.push(merged),
                Some(None) => {}
                None => group.children.push(child),
            }
        }
    }

    // A source processed by a custom build cannot also be compiled directly
    let is_replaced = |item: &TreeNode| {
        item.attr("Include")
            .is_some_and(|inc| replaced_inputs.contains(&normalize_path(inc)))
    };
    for group in root.children.iter_mut().filter(|c| c.name == "ItemGroup") {
        group.remove_children(|item| item.name == "ClCompile" && is_replaced(item));
    }
    if let Some(filters) = filters {
        for group in filters.children.iter_mut().filter(|c| c.name == "ItemGroup") {
            group.remove_children(|item| {
                item.name == "CustomBuild"
                    && item
                        .attr("Include")
                        .is_some_and(|inc| removed_includes.iter().any(|r| r == inc))
            });
            for item in group.children.iter_mut() {
                if item.name == "ClCompile" && is_replaced(item) {
                    item.name = "CustomBuild".to_string();
                }
            }
        }
    }
}

/// Result of converting one custom build item.
struct ConvertedItem {
    node: TreeNode,
    /// Normalized paths of generated files whose items become redundant.
    generated: IndexSet<String>,
}

/// Merge per-configuration property sets into item metadata.
fn merge_properties(
    item: &mut TreeNode,
    per_config: &[(ProjectConfiguration, IndexMap<String, String>)],
) {
    let mut names: IndexSet<&str> = IndexSet::new();
    for (_, properties) in per_config {
        names.extend(properties.keys().map(String::as_str));
    }
    for name in names {
        let values: Vec<Option<&String>> = per_config.iter().map(|(_, p)| p.get(name)).collect();
        let shared = values
            .first()
            .copied()
            .flatten()
            .filter(|first| values.iter().all(|v| *v == Some(*first)));
        match shared {
            Some(value) => item
                .children
                .push(TreeNode::element(name).with_text(value.clone())),
            None => {
                for ((config, _), value) in per_config.iter().zip(values) {
                    if let Some(value) = value {
                        item.children.push(
                            TreeNode::element(name)
                                .with_attr("Condition", config.condition())
                                .with_text(value.clone()),
                        );
                    }
                }
            }
        }
    }
}

/// Prepend the generated-files directories to a `;` list, without duplicates.
fn add_generated_paths(store: &dyn SettingsStore, list: &str) -> String {
    let mut entries: IndexSet<String> = ["MocDir", "UicDir", "RccDir"]
        .iter()
        .map(|key| generated_dir(store, key))
        .collect();
    entries.extend(split_list(list).into_iter().map(str::to_string));
    entries.into_iter().collect::<Vec<_>>().join(";")
}

struct Converter<'a> {
    tool: ToolKind,
    path: &'a Utf8Path,
    configs: &'a [ProjectConfiguration],
    store: &'a dyn SettingsStore,
    /// Project items by normalized include, from before any removal.
    project_items: HashMap<String, Vec<&'a TreeNode>>,
}

impl Converter<'_> {
    fn issue(&self, include: &str, config: &str, line: Option<usize>, message: String) -> ConversionIssue {
        ConversionIssue {
            file: self.path.to_owned(),
            item: include.to_string(),
            configuration: config.to_string(),
            line,
            message: format!("[{}] {}", self.tool.item_type(), message),
        }
    }

    fn convert(&self, item: &TreeNode) -> Result<ConvertedItem, Vec<ConversionIssue>> {
        let include = item.attr("Include").unwrap_or_default();
        let fallback = [default_configuration()];
        let configs = if self.configs.is_empty() {
            &fallback[..]
        } else {
            self.configs
        };

        let mut issues = Vec::new();
        let mut per_config = Vec::new();
        let mut generated = IndexSet::new();
        for config in configs {
            let Some(command) = config_child(item, "Command", config) else {
                continue;
            };
            if !command.value().to_ascii_lowercase().contains(self.tool.exe()) {
                tracing::warn!(
                    "{}: warning: [{}] converting \"{}\", configuration \"{}\": tool not found: \"{}\"; applying default options",
                    self.path,
                    self.tool.item_type(),
                    include,
                    config.id,
                    self.tool.exe()
                );
                continue;
            }

            let context = MacroContext { config, include };
            let templated = template_command(self.tool, include, command.value(), config);
            let parsed = match parse_command(self.tool, &templated) {
                Ok(parsed) => parsed,
                Err(message) => {
                    issues.push(self.issue(include, &config.id, command.line, message));
                    continue;
                }
            };
            if normalize_path(&context.expand(&parsed.input)) != normalize_path(include) {
                issues.push(self.issue(
                    include,
                    &config.id,
                    command.line,
                    format!("input file '{}' does not match the item", parsed.input),
                ));
                continue;
            }

            // Items for files this step generates are superseded by the typed item
            let mut has_generated = false;
            if let Some(outputs) = config_child(item, "Outputs", config) {
                for output in split_list(&context.expand(outputs.value())) {
                    let output = normalize_path(output);
                    if output == normalize_path(include) {
                        continue;
                    }
                    if let Some(items) = self.project_items.get(&output) {
                        let condition = config_condition(&config.id);
                        has_generated |= items.iter().any(|i| !is_excluded(i, Some(condition.as_str())));
                    }
                    generated.insert(output);
                }
            }

            let mut properties = IndexMap::new();
            properties.insert(
                "ExecutionDescription".to_string(),
                self.tool.description().to_string(),
            );
            properties.extend(parsed.properties);
            properties.insert("InputFile".to_string(), "%(FullPath)".to_string());
            if self.tool == ToolKind::Moc {
                let dynamic = if is_source_file(include) {
                    "input"
                } else if has_generated {
                    "output"
                } else {
                    "false"
                };
                properties.insert("DynamicSource".to_string(), dynamic.to_string());
                if let Some(paths) = properties.get_mut("IncludePath") {
                    *paths = add_generated_paths(self.store, paths);
                }
            }
            per_config.push((config.clone(), properties));
        }

        if !issues.is_empty() {
            return Err(issues);
        }
        if per_config.is_empty() {
            return Err(vec![self.issue(
                include,
                "",
                item.line,
                "no configuration invokes the tool".to_string(),
            )]);
        }

        let mut node = TreeNode::element(self.tool.item_type()).with_attr("Include", include);
        node.line = item.line;
        node.children.extend(
            item.children_named("ExcludedFromBuild").cloned(),
        );
        merge_properties(&mut node, &per_config);
        Ok(ConvertedItem { node, generated })
    }
}

fn items_by_path(root: &TreeNode) -> HashMap<String, Vec<&TreeNode>> {
    let mut items: HashMap<String, Vec<&TreeNode>> = HashMap::new();
    for group in root.children_named("ItemGroup") {
        for item in &group.children {
            if let Some(include) = item.attr("Include") {
                items.entry(normalize_path(include)).or_default().push(item);
            }
        }
    }
    items
}

fn remove_generated(root: &mut TreeNode, generated: &IndexSet<String>) {
    for group in root.children.iter_mut().filter(|c| c.name == "ItemGroup") {
        group.remove_children(|item| {
            item.name != "ProjectConfiguration"
                && item
                    .attr("Include")
                    .is_some_and(|inc| generated.contains(&normalize_path(inc)))
        });
    }
}

/// Convert every tool's custom builds. Returns one issue per failed item and
/// configuration.
pub(super) fn convert_custom_builds(
    migrator: &SchemaMigrator,
    project: &mut MsBuildProject,
) -> StepResult {
    let configs = project.configurations();
    let path = project.path().to_owned();
    let mut issues = Vec::new();
    let mut converted = 0usize;

    for tool in ToolKind::ALL {
        {
            let (root, filters) = project.roots_mut();
            merge_by_input(tool, root, filters, &configs);
        }

        let results: Vec<(String, Result<ConvertedItem, Vec<ConversionIssue>>)> = {
            let root = project.root();
            let converter = Converter {
                tool,
                path: &path,
                configs: &configs,
                store: migrator.settings(),
                project_items: items_by_path(root),
            };
            root.children_named("ItemGroup")
                .flat_map(|g| g.children.iter())
                .filter(|item| is_tool_build(tool, item))
                .map(|item| {
                    let include = item.attr("Include").unwrap_or_default().to_string();
                    (include, converter.convert(item))
                })
                .collect()
        };

        for (include, result) in results {
            match result {
                Ok(item) => {
                    let (root, filters) = project.roots_mut();
                    remove_generated(root, &item.generated);
                    let mut node = Some(item.node);
                    for group in root.children.iter_mut().filter(|c| c.name == "ItemGroup") {
                        for child in group.children.iter_mut() {
                            if child.name == "CustomBuild" && child.attr("Include") == Some(include.as_str()) {
                                if let Some(node) = node.take() {
                                    *child = node;
                                }
                            }
                        }
                    }
                    if let Some(filters) = filters {
                        remove_generated(filters, &item.generated);
                        for group in filters.children.iter_mut().filter(|c| c.name == "ItemGroup") {
                            for child in group.children.iter_mut() {
                                if child.name == "CustomBuild"
                                    && child.attr("Include") == Some(include.as_str())
                                {
                                    child.name = tool.item_type().to_string();
                                }
                            }
                        }
                    }
                    converted += 1;
                }
                Err(item_issues) => {
                    for issue in &item_issues {
                        tracing::error!("{}", issue);
                    }
                    issues.extend(item_issues);
                }
            }
        }
    }

    if converted > 0 {
        let store = migrator.settings();
        for group in project
            .root_mut()
            .children
            .iter_mut()
            .filter(|c| c.name == "ItemDefinitionGroup")
        {
            for cl in group.children.iter_mut().filter(|c| c.name == "ClCompile") {
                for dirs in cl
                    .children
                    .iter_mut()
                    .filter(|c| c.name == "AdditionalIncludeDirectories")
                {
                    let value = add_generated_paths(store, dirs.value());
                    dirs.set_value(value);
                }
            }
        }
        tracing::info!("{}: converted {} custom build item(s)", path, converted);
    }
    project.commit("Converting custom build steps to Qt/MSBuild items");
    Ok(issues)
}
