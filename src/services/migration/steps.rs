//! Tree transformations run by [`SchemaMigrator`](super::SchemaMigrator).
//!
//! Each step commits after every logical sub-edit so the conversion report reads
//! as a list of small, named changes.

use super::modules::{ModuleUsage, ToolSettings, file_name, split_list, unquote};
use super::project::{
    CPP_PROPS, CPP_TARGETS, LABEL_GLOBALS, LABEL_PROPERTY_SHEETS, LABEL_QT_SETTINGS,
    LABEL_USER_MACROS, MsBuildProject, QT_DEFAULTS_PROPS, QT_PROPS, has_label, import_group,
    imports, parse_config_condition,
};
use super::{MigrationError, SchemaMigrator};
use crate::models::{ConversionIssue, TreeNode};
use indexmap::IndexMap;

pub type StepResult = Result<Vec<ConversionIssue>, MigrationError>;

/// Project-level properties of the legacy user-properties block that the
/// conversion supersedes.
const LEGACY_USER_PROPERTIES: &[&str] = &[
    "lupdateOptions",
    "lupdateOnBuild",
    "lreleaseOptions",
    "MocDir",
    "MocOptions",
    "RccDir",
    "UicDir",
];

/// Per-platform tool version attribute prefix in the legacy user-properties block.
const LEGACY_VERSION_PREFIX: &str = "Qt5Version_x0020_";

const OLD_ITEM_PROPERTIES: &[&str] = &["QTDIR", "InputFile", "OutputFile"];
const OLD_PREPROCESSOR_PROPERTIES: &[&str] = &["IncludePath", "Define", "Undefine"];

fn anchor_error(project: &MsBuildProject, step: &'static str, anchor: &str) -> MigrationError {
    MigrationError::AnchorNotFound {
        path: project.path().to_owned(),
        step,
        anchor: anchor.to_string(),
    }
}

fn is_qt_settings(node: &TreeNode) -> bool {
    node.name == "PropertyGroup" && has_label(node, LABEL_QT_SETTINGS)
}

fn user_properties(root: &TreeNode) -> Option<&TreeNode> {
    root.child("ProjectExtensions")?
        .child("VisualStudio")?
        .child("UserProperties")
}

fn user_properties_mut(root: &mut TreeNode) -> Option<&mut TreeNode> {
    root.child_mut("ProjectExtensions")?
        .child_mut("VisualStudio")?
        .child_mut("UserProperties")
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Rewrite a `;`-list property of one tool in every item definition group.
fn rewrite_tool_lists(
    root: &mut TreeNode,
    tool: &str,
    property: &str,
    keep: impl Fn(&str) -> Option<String>,
) {
    for group in root
        .children
        .iter_mut()
        .filter(|c| c.name == "ItemDefinitionGroup")
    {
        for settings in group.children.iter_mut().filter(|c| c.name == tool) {
            for list in settings.children.iter_mut().filter(|c| c.name == property) {
                let kept: Vec<String> = split_list(list.value())
                    .into_iter()
                    .filter_map(&keep)
                    .collect();
                list.set_value(kept.join(";"));
            }
        }
    }
}

/// Index at which relocated tool settings are inserted.
///
/// Tried in order: after the last `UserMacros` property group, after the last
/// `PropertySheets` import group, before the first item definition group, before
/// the first item group, before the C++ targets import, at the end of the project.
pub(crate) fn insertion_index(root: &TreeNode) -> Option<usize> {
    let after_last = |name: &str, label: &str| {
        root.rposition(|c| c.name == name && has_label(c, label))
            .map(|i| i + 1)
    };
    // "Before" an anchor means right after the element preceding it. An anchor at
    // index 0 has no predecessor, so that anchor is skipped and the next one tried.
    let before_first = |pred: &dyn Fn(&TreeNode) -> bool| root.position(pred).filter(|&i| i > 0);

    after_last("PropertyGroup", LABEL_USER_MACROS)
        .or_else(|| after_last("ImportGroup", LABEL_PROPERTY_SHEETS))
        .or_else(|| before_first(&|c: &TreeNode| c.name == "ItemDefinitionGroup"))
        .or_else(|| before_first(&|c: &TreeNode| c.name == "ItemGroup"))
        .or_else(|| {
            before_first(&|c: &TreeNode| {
                c.name == "Import" && c.attr("Project") == Some(CPP_TARGETS)
            })
        })
        .or_else(|| (!root.children.is_empty()).then_some(root.children.len()))
}

/// Upgrade a first- or second-generation project to the v3 layout.
pub(super) fn upgrade_legacy(migrator: &SchemaMigrator, project: &mut MsBuildProject) -> StepResult {
    const STEP: &str = "legacy upgrade";

    if !project.add_build_system_references() {
        return Err(anchor_error(
            project,
            STEP,
            &format!("{} / {}", CPP_PROPS, CPP_TARGETS),
        ));
    }
    let Some(qt_props) = project.root().position(|c| imports(c, QT_PROPS)) else {
        return Err(anchor_error(project, STEP, QT_PROPS));
    };

    // Tool settings groups, one per configuration, just above the tool import
    let configs = project.configurations();
    let missing: Vec<_> = configs
        .iter()
        .filter(|config| {
            let condition = config.condition();
            !project
                .root()
                .children
                .iter()
                .any(|c| is_qt_settings(c) && c.attr("Condition") == Some(condition.as_str()))
        })
        .map(|config| {
            TreeNode::element("PropertyGroup")
                .with_attr("Label", LABEL_QT_SETTINGS)
                .with_attr("Condition", config.condition())
        })
        .collect();
    let children = &mut project.root_mut().children;
    for (offset, group) in missing.into_iter().enumerate() {
        children.insert(qt_props + offset, group);
    }
    project.commit("Creating QtSettings property group");

    // Tool install reference, per platform, from the legacy user properties
    let legacy_versions: IndexMap<String, String> = user_properties(project.root())
        .map(|props| {
            props
                .attributes
                .iter()
                .filter_map(|(name, value)| {
                    name.strip_prefix(LEGACY_VERSION_PREFIX)
                        .map(|platform| (platform.to_string(), value.clone()))
                })
                .collect()
        })
        .unwrap_or_default();
    let default_version = migrator.default_tool_version().map(str::to_string);
    for group in project.root_mut().children.iter_mut().filter(|c| is_qt_settings(c)) {
        if group.child("QtInstall").is_some() {
            continue;
        }
        let platform = group
            .attr("Condition")
            .and_then(parse_config_condition)
            .map(|(_, platform)| platform);
        let install = platform
            .and_then(|p| legacy_versions.get(&p).cloned())
            .filter(|v| !v.is_empty())
            .or_else(|| default_version.clone());
        if let Some(install) = install {
            group
                .children
                .push(TreeNode::element("QtInstall").with_text(install));
        }
    }
    project.commit("Copying Qt build reference to QtInstall project property");

    let usage = ModuleUsage::scan(&ToolSettings::collect(project.root()));
    strip_module_settings(project, &usage);

    let modules = usage.modules_property();
    for group in project.root_mut().children.iter_mut().filter(|c| is_qt_settings(c)) {
        if group.child("QtModules").is_none() {
            group
                .children
                .push(TreeNode::element("QtModules").with_text(modules.clone()));
        }
    }
    project.commit("Adding Qt module names to QtModules project property");

    if let Some(props) = user_properties_mut(project.root_mut()) {
        props.attributes.retain(|name, _| {
            !(name.starts_with(LEGACY_VERSION_PREFIX)
                || LEGACY_USER_PROPERTIES.contains(&name.as_str()))
        });
    }
    project.commit("Removing project user properties (format version 2)");

    if let Some(user) = project.user_root_mut() {
        for group in user
            .children
            .iter_mut()
            .filter(|c| c.name == "PropertyGroup")
        {
            group.remove_children(|prop| match prop.name.as_str() {
                "QTDIR" | "QmlDebug" | "QmlDebugSettings" => true,
                "LocalDebuggerCommandArguments" => prop.value() == "$(QmlDebug)",
                "LocalDebuggerEnvironment" => prop.value() == r"PATH=$(QTDIR)\bin%3b$(PATH)",
                _ => false,
            });
        }
        project.commit("Removing old properties from .user file");
    }

    split_output_files(project.root_mut());
    project.commit("Converting OutputFile to <tool>Dir and <tool>FileName");

    for group in project
        .root_mut()
        .children
        .iter_mut()
        .filter(|c| c.name == "ItemDefinitionGroup" || c.name == "ItemGroup")
    {
        for item in group.children.iter_mut() {
            let preprocessor = match item.name.as_str() {
                "QtMoc" | "QtRepc" => true,
                "QtRcc" | "QtUic" => false,
                _ => continue,
            };
            item.remove_children(|prop| {
                let name = prop.name.as_str();
                OLD_ITEM_PROPERTIES.contains(&name)
                    || (preprocessor && OLD_PREPROCESSOR_PROPERTIES.contains(&name))
            });
        }
    }
    project.commit("Removing old properties from project items");

    Ok(Vec::new())
}

fn strip_module_settings(project: &mut MsBuildProject, usage: &ModuleUsage) {
    let not_tool_root = |entry: &str| {
        let entry = unquote(entry);
        (!starts_with_ignore_case(entry, "$(QTDIR)")).then(|| entry.to_string())
    };
    let not_module_define =
        |entry: &str| (!usage.defines.contains(entry)).then(|| entry.to_string());

    rewrite_tool_lists(
        project.root_mut(),
        "ClCompile",
        "PreprocessorDefinitions",
        not_module_define,
    );
    project.commit("Removing Qt module macros from compiler properties");

    rewrite_tool_lists(
        project.root_mut(),
        "ClCompile",
        "AdditionalIncludeDirectories",
        not_tool_root,
    );
    project.commit("Removing Qt module include paths from compiler properties");

    rewrite_tool_lists(project.root_mut(), "Link", "AdditionalDependencies", |entry| {
        (!usage.is_module_lib(entry)).then(|| entry.to_string())
    });
    project.commit("Removing Qt module libraries from linker properties");

    rewrite_tool_lists(
        project.root_mut(),
        "Link",
        "AdditionalLibraryDirectories",
        not_tool_root,
    );
    project.commit("Removing Qt lib path from linker properties");

    rewrite_tool_lists(
        project.root_mut(),
        "ResourceCompile",
        "PreprocessorDefinitions",
        not_module_define,
    );
    project.commit("Removing Qt module macros from resource compiler properties");
}

/// Replace each tool item's `OutputFile` with `<tool>Dir` and `<tool>FileName`.
fn split_output_files(root: &mut TreeNode) {
    for group in root
        .children
        .iter_mut()
        .filter(|c| c.name == "ItemDefinitionGroup" || c.name == "ItemGroup")
    {
        for item in group
            .children
            .iter_mut()
            .filter(|c| matches!(c.name.as_str(), "QtMoc" | "QtRcc" | "QtUic"))
        {
            let Some(output) = item.child("OutputFile").map(|o| o.value().to_string()) else {
                continue;
            };
            let file = file_name(&output).to_string();
            let dir = output[..output.len() - file.len()].trim_end_matches(['\\', '/']);
            let dir = if dir.is_empty() { "$(ProjectDir)" } else { dir };
            let tool = item.name.clone();
            item.children
                .push(TreeNode::element(format!("{}Dir", tool)).with_text(dir));
            item.children
                .push(TreeNode::element(format!("{}FileName", tool)).with_text(file));
        }
    }
}

/// Move the tool import and per-configuration settings to the standard location.
pub(super) fn relocate_tool_settings(
    _migrator: &SchemaMigrator,
    project: &mut MsBuildProject,
) -> StepResult {
    const STEP: &str = "relocate tool settings";

    if !project.root().children.iter().any(|c| imports(c, QT_PROPS)) {
        return Err(anchor_error(project, STEP, QT_PROPS));
    }

    let mut old_install: IndexMap<String, TreeNode> = IndexMap::new();
    for group in project
        .root_mut()
        .children
        .iter_mut()
        .filter(|c| c.name == "PropertyGroup")
    {
        let condition = group.attr("Condition").unwrap_or_default().to_string();
        for install in group.remove_children(|c| c.name == "QtInstall") {
            old_install.entry(condition.clone()).or_insert(install);
        }
    }
    project.commit("Removing outdated QtInstall property");

    let mut old_settings: IndexMap<String, TreeNode> = IndexMap::new();
    for group in project.root_mut().remove_children(is_qt_settings) {
        let condition = group.attr("Condition").unwrap_or_default().to_string();
        old_settings.entry(condition).or_insert(group);
    }
    project.commit("Removing outdated QtSettings properties");

    // Detach the current import; its group goes too when nothing else is in it
    let root = project.root_mut();
    if let Some(index) = root.position(|c| imports(c, QT_PROPS)) {
        let group = &mut root.children[index];
        if group.children.iter().filter(|c| c.is_element()).count() == 1 {
            root.children.remove(index);
        } else {
            group.remove_children(|c| c.name == "Import" && c.attr("Project") == Some(QT_PROPS));
        }
    }
    let Some(index) = insertion_index(project.root()) else {
        return Err(anchor_error(project, STEP, "insertion point"));
    };
    project
        .root_mut()
        .children
        .insert(index, import_group(QT_PROPS));
    project.commit("Relocating import of qt.props");

    let configs = project.configurations();
    let children = &mut project.root_mut().children;
    for (offset, config) in configs.iter().enumerate() {
        children.insert(
            index + offset,
            TreeNode::element("PropertyGroup")
                .with_attr("Label", LABEL_QT_SETTINGS)
                .with_attr("Condition", config.condition()),
        );
    }
    project.commit("Creating QtSettings property group");

    let root = project.root_mut();
    if !root.children.iter().any(|c| imports(c, QT_DEFAULTS_PROPS)) {
        root.children.insert(index, import_group(QT_DEFAULTS_PROPS));
    }
    project.commit("Adding import of default property values");

    for group in project
        .root_mut()
        .children
        .iter_mut()
        .filter(|c| is_qt_settings(c))
    {
        let condition = group.attr("Condition").unwrap_or_default().to_string();
        if let Some(install) = old_install.shift_remove(&condition) {
            group.children.push(install);
        }
        if let Some(old) = old_settings.shift_remove(&condition) {
            group.children.extend(old.children);
        }
    }
    project.commit("Moving Qt build properties to QtSettings import groups");

    for condition in old_settings.keys().chain(old_install.keys()) {
        tracing::warn!(
            "{}: dropping tool settings for unknown configuration condition '{}'",
            project.path(),
            condition
        );
    }
    Ok(Vec::new())
}

/// Move the tool build-system path property into the `Globals` group.
pub(super) fn move_tool_path_to_globals(
    _migrator: &SchemaMigrator,
    project: &mut MsBuildProject,
) -> StepResult {
    const STEP: &str = "global tool path";

    let root = project.root();
    let Some(globals) = root.position(|c| c.name == "PropertyGroup" && has_label(c, LABEL_GLOBALS))
    else {
        return Err(anchor_error(project, STEP, LABEL_GLOBALS));
    };
    let found = root
        .children
        .iter()
        .enumerate()
        .skip(globals + 1)
        .find(|(_, c)| c.name == "PropertyGroup" && c.child("QtMsBuild").is_some())
        .map(|(i, _)| i);
    let Some(source) = found else {
        return Ok(Vec::new());
    };

    let children = &mut project.root_mut().children;
    let group = &mut children[source];
    let condition = group.attr("Condition").map(str::to_string);
    let Some(position) = group.position(|c| c.name == "QtMsBuild") else {
        return Ok(Vec::new());
    };
    let mut property = group.children.remove(position);
    match condition {
        Some(condition) => property.set_attr("Condition", condition),
        None => {
            property.remove_attr("Condition");
        }
    }
    if !group.children.iter().any(TreeNode::is_element) {
        children.remove(source);
    }
    children[globals].children.push(property);
    project.commit("Moving Qt/MSBuild path to global property");
    Ok(Vec::new())
}

/// Give every configuration its own unlabelled property group and move the
/// configuration-specific properties of shared unlabelled groups into it.
pub(super) fn populate_configuration_groups(
    _migrator: &SchemaMigrator,
    project: &mut MsBuildProject,
) -> StepResult {
    const STEP: &str = "populate configuration groups";

    if !project.root().children.iter().any(|c| imports(c, QT_PROPS)) {
        return Err(anchor_error(project, STEP, QT_PROPS));
    }

    let mut groups: IndexMap<String, TreeNode> = project
        .configurations()
        .iter()
        .map(|config| {
            let condition = config.condition();
            let group = TreeNode::element("PropertyGroup").with_attr("Condition", condition.clone());
            (condition, group)
        })
        .collect();

    let root = project.root_mut();
    for group in root
        .children
        .iter_mut()
        .filter(|c| c.name == "PropertyGroup" && c.attr("Label").is_none())
    {
        let group_condition = group.attr("Condition").map(str::to_string);
        let moved = group.remove_children(|prop| {
            prop.is_element()
                && prop
                    .attr("Condition")
                    .or(group_condition.as_deref())
                    .is_some_and(|c| groups.contains_key(c))
        });
        for mut prop in moved {
            let condition = prop
                .remove_attr("Condition")
                .or_else(|| group_condition.clone())
                .unwrap_or_default();
            if let Some(target) = groups.get_mut(&condition) {
                target.children.push(prop);
            }
        }
    }
    root.children.retain(|c| {
        !(c.name == "PropertyGroup"
            && c.attr("Label").is_none()
            && !c.children.iter().any(TreeNode::is_element))
    });

    let index = match root.position(|c| imports(c, QT_DEFAULTS_PROPS)) {
        Some(defaults) => Some(defaults + 1),
        None => insertion_index(root),
    };
    let Some(index) = index else {
        return Err(anchor_error(project, STEP, QT_DEFAULTS_PROPS));
    };
    for (offset, (_, group)) in groups.drain(..).enumerate() {
        root.children.insert(index + offset, group);
    }
    project.commit("Populating uncategorized property groups");
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_index_prefers_user_macros() {
        let root = TreeNode::element("Project")
            .with_child(TreeNode::element("ItemGroup"))
            .with_child(TreeNode::element("ImportGroup").with_attr("Label", "PropertySheets"))
            .with_child(TreeNode::element("PropertyGroup").with_attr("Label", "UserMacros"))
            .with_child(TreeNode::element("ItemDefinitionGroup"));
        assert_eq!(insertion_index(&root), Some(3));
    }

    #[test]
    fn test_insertion_index_fallbacks() {
        let sheets = TreeNode::element("Project")
            .with_child(TreeNode::element("ItemGroup"))
            .with_child(TreeNode::element("ImportGroup").with_attr("Label", "PropertySheets"))
            .with_child(TreeNode::element("ItemDefinitionGroup"));
        assert_eq!(insertion_index(&sheets), Some(2));

        let definitions = TreeNode::element("Project")
            .with_child(TreeNode::element("ItemGroup"))
            .with_child(TreeNode::element("ItemDefinitionGroup"));
        assert_eq!(insertion_index(&definitions), Some(1));

        let end = TreeNode::element("Project").with_child(TreeNode::element("PropertyGroup"));
        assert_eq!(insertion_index(&end), Some(1));

        assert_eq!(insertion_index(&TreeNode::element("Project")), None);
    }

    #[test]
    fn test_insertion_index_skips_leading_anchor() {
        let root = TreeNode::element("Project")
            .with_child(TreeNode::element("ItemDefinitionGroup"))
            .with_child(TreeNode::element("ItemGroup"));
        assert_eq!(insertion_index(&root), Some(1));

        let only = TreeNode::element("Project").with_child(TreeNode::element("ItemDefinitionGroup"));
        assert_eq!(insertion_index(&only), Some(1));
    }

    #[test]
    fn test_split_output_files() {
        let mut root = TreeNode::element("Project").with_child(
            TreeNode::element("ItemDefinitionGroup")
                .with_child(
                    TreeNode::element("QtMoc").with_child(
                        TreeNode::element("OutputFile").with_text(r"gen\moc_%(Filename).cpp"),
                    ),
                )
                .with_child(
                    TreeNode::element("QtUic")
                        .with_child(TreeNode::element("OutputFile").with_text("ui_%(Filename).h")),
                ),
        );
        split_output_files(&mut root);
        let group = &root.children[0];
        let moc = group.child("QtMoc").unwrap();
        assert_eq!(moc.child("QtMocDir").unwrap().value(), "gen");
        assert_eq!(moc.child("QtMocFileName").unwrap().value(), "moc_%(Filename).cpp");
        let uic = group.child("QtUic").unwrap();
        assert_eq!(uic.child("QtUicDir").unwrap().value(), "$(ProjectDir)");
    }

    #[test]
    fn test_rewrite_tool_lists() {
        let mut root = TreeNode::element("Project").with_child(
            TreeNode::element("ItemDefinitionGroup").with_child(
                TreeNode::element("Link").with_child(
                    TreeNode::element("AdditionalLibraryDirectories")
                        .with_text(r#""$(QTDIR)\lib";C:\libs;$(qtdir)\plugins"#),
                ),
            ),
        );
        rewrite_tool_lists(&mut root, "Link", "AdditionalLibraryDirectories", |entry| {
            let entry = unquote(entry);
            (!starts_with_ignore_case(entry, "$(QTDIR)")).then(|| entry.to_string())
        });
        let value = root.children[0].children[0].children[0].value();
        assert_eq!(value, r"C:\libs");
    }
}
