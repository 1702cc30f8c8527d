use crate::models::TreeNode;
use indexmap::IndexSet;
use regex::Regex;
use std::sync::LazyLock;

/// A library module known to the conversion, for one major version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolModule {
    /// Name used in the `QtModules` property (`core`, `widgets`, ...).
    pub name: &'static str,
    pub major: u32,
    /// Include directory under the install root (`QtCore`).
    pub include_dir: String,
    pub define: String,
    pub lib_release: String,
    pub lib_debug: String,
}

// (module name, library stem)
const MODULE_TABLE: &[(&str, &str)] = &[
    ("core", "Core"),
    ("gui", "Gui"),
    ("widgets", "Widgets"),
    ("network", "Network"),
    ("sql", "Sql"),
    ("xml", "Xml"),
    ("testlib", "Test"),
    ("concurrent", "Concurrent"),
    ("opengl", "OpenGL"),
    ("openglwidgets", "OpenGLWidgets"),
    ("printsupport", "PrintSupport"),
    ("svg", "Svg"),
    ("qml", "Qml"),
    ("quick", "Quick"),
    ("quickwidgets", "QuickWidgets"),
    ("multimedia", "Multimedia"),
    ("serialport", "SerialPort"),
    ("websockets", "WebSockets"),
    ("webenginewidgets", "WebEngineWidgets"),
    ("charts", "Charts"),
    ("dbus", "DBus"),
    ("designer", "Designer"),
    ("help", "Help"),
    ("uitools", "UiTools"),
];

static CATALOG: LazyLock<Vec<ToolModule>> = LazyLock::new(|| {
    [5, 6]
        .into_iter()
        .flat_map(|major| {
            MODULE_TABLE.iter().map(move |&(name, stem)| ToolModule {
                name,
                major,
                include_dir: format!("Qt{}", stem),
                define: format!("QT_{}_LIB", stem.to_ascii_uppercase()),
                lib_release: format!("Qt{}{}.lib", major, stem),
                lib_debug: format!("Qt{}{}d.lib", major, stem),
            })
        })
        .collect()
});

pub fn catalog() -> &'static [ToolModule] {
    &CATALOG
}

/// Split a `;`-separated MSBuild list, dropping empty entries.
pub fn split_list(value: &str) -> Vec<&str> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Last path component, accepting both separators.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Tool settings found in the `ItemDefinitionGroup`s of a project.
#[derive(Debug, Default)]
pub struct ToolSettings<'a> {
    pub compiler: Vec<&'a TreeNode>,
    pub linker: Vec<&'a TreeNode>,
    pub resource_compiler: Vec<&'a TreeNode>,
}

impl<'a> ToolSettings<'a> {
    pub fn collect(project: &'a TreeNode) -> Self {
        let mut settings = Self::default();
        for group in project.children_named("ItemDefinitionGroup") {
            for tool in &group.children {
                match tool.name.as_str() {
                    "ClCompile" => settings.compiler.push(tool),
                    "Link" => settings.linker.push(tool),
                    "ResourceCompile" => settings.resource_compiler.push(tool),
                    _ => {}
                }
            }
        }
        settings
    }

    fn values(tools: &[&'a TreeNode], property: &'a str) -> impl Iterator<Item = &'a str> {
        tools
            .iter()
            .copied()
            .flat_map(move |t| t.children_named(property))
            .flat_map(|p| split_list(p.value()))
    }

    fn is_used(&self, module: &ToolModule) -> bool {
        let linked = Self::values(&self.linker, "AdditionalDependencies").any(|lib| {
            let lib = file_name(unquote(lib));
            lib.eq_ignore_ascii_case(&module.lib_release)
                || lib.eq_ignore_ascii_case(&module.lib_debug)
        });
        linked
            || Self::values(&self.compiler, "PreprocessorDefinitions").any(|d| d == module.define)
            || Self::values(&self.resource_compiler, "PreprocessorDefinitions")
                .any(|d| d == module.define)
    }

    fn uses_private_headers(&self, module: &ToolModule) -> bool {
        let pattern = format!(
            r"^\$\(QTDIR\)[\\/]include[\\/]{}[\\/]\d+\.\d+\.\d+",
            regex::escape(&module.include_dir)
        );
        let Ok(pattern) = Regex::new(&pattern) else {
            return false;
        };
        Self::values(&self.compiler, "AdditionalIncludeDirectories")
            .any(|dir| pattern.is_match(unquote(dir)))
    }
}

/// What the module scan decided to strip and record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ModuleUsage {
    /// Names for the `QtModules` property, in catalog order.
    pub names: IndexSet<String>,
    pub defines: IndexSet<String>,
    /// Library file names, lower-cased.
    pub libs: IndexSet<String>,
}

impl ModuleUsage {
    pub fn scan(settings: &ToolSettings<'_>) -> Self {
        let mut usage = Self::default();
        for module in catalog() {
            if !settings.is_used(module) {
                continue;
            }
            usage.names.insert(module.name.to_string());
            usage.defines.insert(module.define.clone());
            usage.libs.insert(module.lib_release.to_ascii_lowercase());
            usage.libs.insert(module.lib_debug.to_ascii_lowercase());
            if settings.uses_private_headers(module) {
                usage.names.insert(format!("{}-private", module.name));
            }
        }
        usage
    }

    pub fn is_module_lib(&self, entry: &str) -> bool {
        self.libs
            .contains(&file_name(unquote(entry)).to_ascii_lowercase())
    }

    pub fn modules_property(&self) -> String {
        self.names.iter().cloned().collect::<Vec<_>>().join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idg(children: Vec<TreeNode>) -> TreeNode {
        let mut group = TreeNode::element("ItemDefinitionGroup");
        group.children = children;
        TreeNode::element("Project").with_child(group)
    }

    #[test]
    fn test_catalog_covers_both_majors() {
        let core: Vec<_> = catalog().iter().filter(|m| m.name == "core").collect();
        assert_eq!(core.len(), 2);
        assert_eq!(core[0].lib_debug, "Qt5Cored.lib");
        assert_eq!(core[1].lib_release, "Qt6Core.lib");
        assert_eq!(core[0].define, "QT_CORE_LIB");
    }

    #[test]
    fn test_list_helpers() {
        assert_eq!(split_list("a; b;;c;"), vec!["a", "b", "c"]);
        assert_eq!(unquote("\"x y\""), "x y");
        assert_eq!(file_name(r"$(QTDIR)\lib\Qt5Gui.lib"), "Qt5Gui.lib");
        assert_eq!(file_name("lib/Qt6Gui.lib"), "Qt6Gui.lib");
    }

    #[test]
    fn test_scan_detects_linked_and_defined_modules() {
        let project = idg(vec![
            TreeNode::element("ClCompile")
                .with_child(
                    TreeNode::element("PreprocessorDefinitions")
                        .with_text("UNICODE;QT_WIDGETS_LIB;%(PreprocessorDefinitions)"),
                )
                .with_child(
                    TreeNode::element("AdditionalIncludeDirectories")
                        .with_text(r".;$(QTDIR)\include;$(QTDIR)\include\QtCore\5.15.2"),
                ),
            TreeNode::element("Link").with_child(
                TreeNode::element("AdditionalDependencies")
                    .with_text(r"$(QTDIR)\lib\Qt5Cored.lib;kernel32.lib"),
            ),
        ]);
        let settings = ToolSettings::collect(&project);
        let usage = ModuleUsage::scan(&settings);

        assert_eq!(usage.modules_property(), "core;core-private;widgets");
        assert!(usage.defines.contains("QT_WIDGETS_LIB"));
        assert!(usage.is_module_lib(r"$(QTDIR)\lib\Qt5Core.lib"));
        assert!(!usage.is_module_lib("kernel32.lib"));
    }

    #[test]
    fn test_scan_without_modules_is_empty() {
        let project = idg(vec![TreeNode::element("ClCompile")]);
        let usage = ModuleUsage::scan(&ToolSettings::collect(&project));
        assert!(usage.names.is_empty());
        assert_eq!(usage.modules_property(), "");
    }
}
