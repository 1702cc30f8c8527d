use super::MigrationError;
use crate::models::{SchemaVersion, StructuredDocument, TreeNode};
use crate::services::journal::{DocumentId, JournalError, SaveOutcome, TransactionJournal};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::sync::LazyLock;

pub const QT_PROPS: &str = r"$(QtMsBuild)\qt.props";
pub const QT_DEFAULTS_PROPS: &str = r"$(QtMsBuild)\qt_defaults.props";
pub const QT_TARGETS: &str = r"$(QtMsBuild)\qt.targets";
pub const CPP_PROPS: &str = r"$(VCTargetsPath)\Microsoft.Cpp.props";
pub const CPP_TARGETS: &str = r"$(VCTargetsPath)\Microsoft.Cpp.targets";

pub const LABEL_GLOBALS: &str = "Globals";
pub const LABEL_QT_SETTINGS: &str = "QtSettings";
pub const LABEL_USER_MACROS: &str = "UserMacros";
pub const LABEL_PROPERTY_SHEETS: &str = "PropertySheets";

/// Extension of the conversion report written next to the project.
pub const REPORT_EXTENSION: &str = "conversion.json";

static CONFIG_CONDITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*'\$\(Configuration\)\|\$\(Platform\)'\s*==\s*'(\w+)\|(\w+)'\s*$")
        .expect("valid regex")
});

/// Condition selecting one build configuration, e.g. `Debug|x64`.
pub fn config_condition(config_id: &str) -> String {
    format!("'$(Configuration)|$(Platform)'=='{}'", config_id)
}

/// Split a configuration condition into (configuration, platform).
pub fn parse_config_condition(condition: &str) -> Option<(String, String)> {
    let caps = CONFIG_CONDITION.captures(condition)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

pub fn has_label(node: &TreeNode, label: &str) -> bool {
    node.attr("Label") == Some(label)
}

/// Whether `group` is an ImportGroup containing an import of `project`.
pub fn imports(group: &TreeNode, project: &str) -> bool {
    group.name == "ImportGroup"
        && group
            .children_named("Import")
            .any(|i| i.attr("Project") == Some(project))
}

/// `<ImportGroup Condition="Exists('...')"><Import Project="..." /></ImportGroup>`
pub fn import_group(project: &str) -> TreeNode {
    TreeNode::element("ImportGroup")
        .with_attr("Condition", format!("Exists('{}')", project))
        .with_child(TreeNode::element("Import").with_attr("Project", project))
}

/// One `ProjectConfiguration` item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfiguration {
    /// `Configuration|Platform`
    pub id: String,
    pub configuration: String,
    pub platform: String,
    /// Child properties of the item, in order.
    pub properties: Vec<(String, String)>,
}

impl ProjectConfiguration {
    pub fn condition(&self) -> String {
        config_condition(&self.id)
    }
}

/// An MSBuild project file with its `.filters` and `.user` sidecars, edited through
/// one journal.
#[derive(Debug)]
pub struct MsBuildProject {
    journal: TransactionJournal,
    project: DocumentId,
    filters: Option<DocumentId>,
    user: Option<DocumentId>,
}

impl MsBuildProject {
    /// Load a project and whichever sidecars exist.
    ///
    /// Fails without side effects if the project is missing or any file is not
    /// well-formed XML.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let project = StructuredDocument::load(path)?;

        let filters_path = Utf8PathBuf::from(format!("{}.filters", path));
        let filters = if filters_path.exists() {
            Some(StructuredDocument::load(&filters_path)?)
        } else {
            None
        };
        let user_path = Utf8PathBuf::from(format!("{}.user", path));
        let user = if user_path.exists() {
            Some(StructuredDocument::load(&user_path)?)
        } else {
            None
        };

        tracing::info!(
            "Loaded project {} (filters: {}, user: {})",
            path,
            filters.is_some(),
            user.is_some()
        );
        Ok(Self::from_documents(project, filters, user))
    }

    pub fn from_documents(
        project: StructuredDocument,
        filters: Option<StructuredDocument>,
        user: Option<StructuredDocument>,
    ) -> Self {
        let mut journal = TransactionJournal::new();
        let project = journal.track(project);
        let filters = filters.map(|doc| journal.track(doc));
        let user = user.map(|doc| journal.track(doc));
        Self {
            journal,
            project,
            filters,
            user,
        }
    }

    pub fn journal(&self) -> &TransactionJournal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut TransactionJournal {
        &mut self.journal
    }

    fn doc(&self, id: DocumentId) -> &StructuredDocument {
        // Ids are only ever handed out by our own journal.
        match self.journal.document(id) {
            Some(doc) => doc,
            None => unreachable!("document id not tracked by this journal"),
        }
    }

    fn doc_mut(&mut self, id: DocumentId) -> &mut StructuredDocument {
        match self.journal.document_mut(id) {
            Some(doc) => doc,
            None => unreachable!("document id not tracked by this journal"),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        self.doc(self.project).path()
    }

    pub fn document(&self) -> &StructuredDocument {
        self.doc(self.project)
    }

    pub fn filters(&self) -> Option<&StructuredDocument> {
        self.filters.map(|id| self.doc(id))
    }

    pub fn user(&self) -> Option<&StructuredDocument> {
        self.user.map(|id| self.doc(id))
    }

    /// `Project` element of the main file.
    pub fn root(&self) -> &TreeNode {
        self.doc(self.project).root()
    }

    pub(crate) fn root_mut(&mut self) -> &mut TreeNode {
        let id = self.project;
        self.doc_mut(id).root_mut()
    }

    pub(crate) fn filters_root_mut(&mut self) -> Option<&mut TreeNode> {
        let id = self.filters?;
        Some(self.doc_mut(id).root_mut())
    }

    /// Main and `.filters` roots, borrowed together.
    pub(crate) fn roots_mut(&mut self) -> (&mut TreeNode, Option<&mut TreeNode>) {
        match self.journal.pair_mut(self.project, self.filters) {
            (Some(project), filters) => (project.root_mut(), filters.map(|f| f.root_mut())),
            (None, _) => unreachable!("document id not tracked by this journal"),
        }
    }

    pub(crate) fn user_root_mut(&mut self) -> Option<&mut TreeNode> {
        let id = self.user?;
        Some(self.doc_mut(id).root_mut())
    }

    /// Commit pending edits.
    ///
    /// # Returns
    /// true if anything changed
    pub fn commit(&mut self, message: &str) -> bool {
        self.journal.commit(message).is_some()
    }

    pub fn report_path(&self) -> Utf8PathBuf {
        self.path().with_extension(REPORT_EXTENSION)
    }

    /// Write changed files and the conversion report.
    pub fn save(&mut self) -> Result<SaveOutcome, JournalError> {
        let report = self.report_path();
        self.journal.save(Some(&report))
    }

    fn globals_index(&self) -> Option<usize> {
        self.root()
            .position(|c| c.name == "PropertyGroup" && has_label(c, LABEL_GLOBALS))
    }

    pub(crate) fn globals_mut(&mut self) -> Option<&mut TreeNode> {
        let index = self.globals_index()?;
        self.root_mut().children.get_mut(index)
    }

    fn keyword(&self) -> Option<&TreeNode> {
        let globals = &self.root().children[self.globals_index()?];
        globals
            .children_named("Keyword")
            .find(|k| SchemaVersion::is_managed_keyword(k.value()))
    }

    /// Format version from the `Keyword` property of the `Globals` group.
    pub fn format_version(&self) -> SchemaVersion {
        self.keyword()
            .map(|k| SchemaVersion::from_keyword(k.value()))
            .unwrap_or(SchemaVersion::UNKNOWN)
    }

    pub(crate) fn set_format_version(&mut self, version: SchemaVersion) -> bool {
        let Some(globals) = self.globals_mut() else {
            return false;
        };
        match globals
            .children
            .iter_mut()
            .find(|k| k.name == "Keyword" && SchemaVersion::is_managed_keyword(k.value()))
        {
            Some(keyword) => {
                keyword.set_value(version.keyword());
                true
            }
            None => false,
        }
    }

    /// Value of the first project-level property named `name`, or empty.
    pub fn property(&self, name: &str) -> String {
        self.root()
            .children_named("PropertyGroup")
            .flat_map(|g| g.children.iter())
            .find(|p| p.name == name)
            .map(|p| p.value().to_string())
            .unwrap_or_default()
    }

    /// Value of the first item-definition property `name` of `item_type`, or empty.
    pub fn item_property(&self, item_type: &str, name: &str) -> String {
        self.root()
            .children_named("ItemDefinitionGroup")
            .flat_map(|g| g.children_named(item_type))
            .flat_map(|i| i.children.iter())
            .find(|p| p.name == name)
            .map(|p| p.value().to_string())
            .unwrap_or_default()
    }

    /// `Include` of every item of `item_type`.
    pub fn items(&self, item_type: &str) -> Vec<String> {
        self.root()
            .children_named("ItemGroup")
            .flat_map(|g| g.children_named(item_type))
            .filter_map(|i| i.attr("Include").map(str::to_string))
            .collect()
    }

    pub fn configurations(&self) -> Vec<ProjectConfiguration> {
        self.root()
            .children_named("ItemGroup")
            .flat_map(|g| g.children_named("ProjectConfiguration"))
            .filter_map(|item| {
                let id = item.attr("Include")?.to_string();
                let (default_config, default_platform) = id.split_once('|')?;
                let configuration = item
                    .child("Configuration")
                    .map(|c| c.value().to_string())
                    .unwrap_or_else(|| default_config.to_string());
                let platform = item
                    .child("Platform")
                    .map(|p| p.value().to_string())
                    .unwrap_or_else(|| default_platform.to_string());
                let properties = item
                    .children
                    .iter()
                    .filter(|c| c.is_element())
                    .map(|c| (c.name.clone(), c.value().to_string()))
                    .collect();
                Some(ProjectConfiguration {
                    id,
                    configuration,
                    platform,
                    properties,
                })
            })
            .collect()
    }

    /// Turn on `/MP` in every compiler item definition.
    pub fn enable_multi_processor_compilation(&mut self) -> bool {
        for group in self.root_mut().children.iter_mut() {
            if group.name != "ItemDefinitionGroup" {
                continue;
            }
            for cl in group.children.iter_mut().filter(|c| c.name == "ClCompile") {
                if cl.child("MultiProcessorCompilation").is_none() {
                    cl.children
                        .push(TreeNode::element("MultiProcessorCompilation").with_text("true"));
                }
            }
        }
        self.commit("Enabling multi-processor compilation");
        true
    }

    /// Set `WindowsTargetPlatformVersion` unless the project already has one.
    pub fn set_default_windows_sdk_version(&mut self, version: &str) -> bool {
        let Some(globals) = self.globals_mut() else {
            return false;
        };
        if globals.child("WindowsTargetPlatformVersion").is_some() {
            return true;
        }
        globals
            .children
            .push(TreeNode::element("WindowsTargetPlatformVersion").with_text(version));
        self.commit("Setting default Windows SDK");
        true
    }

    /// Add the build-system imports and fallback path property.
    ///
    /// # Returns
    /// false if the C++ props/targets imports to anchor them on are missing
    pub fn add_build_system_references(&mut self) -> bool {
        let root = self.root();
        if root.children.iter().any(|c| imports(c, QT_PROPS)) {
            return true;
        }
        let is_import = |c: &TreeNode, project: &str| {
            c.name == "Import" && c.attr("Project") == Some(project)
        };
        let Some(cpp_props) = root.position(|c| is_import(c, CPP_PROPS)) else {
            return false;
        };
        if root.position(|c| is_import(c, CPP_TARGETS)).is_none() {
            return false;
        }

        let fallback = TreeNode::element("PropertyGroup")
            .with_attr(
                "Condition",
                r"'$(QtMsBuild)'=='' or !Exists('$(QtMsBuild)\qt.targets')",
            )
            .with_child(
                TreeNode::element("QtMsBuild").with_text(r"$(MSBuildProjectDirectory)\QtMsBuild"),
            );
        let not_found = TreeNode::element("Target")
            .with_attr("Name", "QtMsBuildNotFound")
            .with_attr("BeforeTargets", "CustomBuild;ClCompile")
            .with_attr(
                "Condition",
                r"!Exists('$(QtMsBuild)\qt.targets') or !Exists('$(QtMsBuild)\qt.props')",
            )
            .with_child(
                TreeNode::element("Message")
                    .with_attr("Importance", "High")
                    .with_attr(
                        "Text",
                        "QtMsBuild: could not locate qt.targets, qt.props; project may not build correctly.",
                    ),
            );

        let children = &mut self.root_mut().children;
        children.insert(cpp_props + 1, fallback);
        children.insert(cpp_props + 2, not_found);
        children.insert(cpp_props + 3, import_group(QT_PROPS));
        if let Some(cpp_targets) = children.iter().position(|c| is_import(c, CPP_TARGETS)) {
            children.insert(cpp_targets + 1, import_group(QT_TARGETS));
        }
        self.commit("Adding reference to Qt/MSBuild");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<Project DefaultTargets="Build" xmlns="http://schemas.microsoft.com/developer/msbuild/2003">
  <ItemGroup Label="ProjectConfigurations">
    <ProjectConfiguration Include="Debug|x64">
      <Configuration>Debug</Configuration>
      <Platform>x64</Platform>
    </ProjectConfiguration>
    <ProjectConfiguration Include="Release|x64">
      <Configuration>Release</Configuration>
      <Platform>x64</Platform>
    </ProjectConfiguration>
  </ItemGroup>
  <PropertyGroup Label="Globals">
    <ProjectGuid>{B12702AD-ABFB-343A-A199-8E24837244A3}</ProjectGuid>
    <Keyword>QtVS_v304</Keyword>
  </PropertyGroup>
  <Import Project="$(VCTargetsPath)\Microsoft.Cpp.props" />
  <ItemDefinitionGroup>
    <ClCompile>
      <WarningLevel>Level3</WarningLevel>
    </ClCompile>
  </ItemDefinitionGroup>
  <ItemGroup>
    <ClCompile Include="main.cpp" />
    <ClCompile Include="widget.cpp" />
  </ItemGroup>
  <Import Project="$(VCTargetsPath)\Microsoft.Cpp.targets" />
</Project>"#;

    fn project() -> MsBuildProject {
        let doc = StructuredDocument::parse("app.vcxproj", PROJECT).unwrap();
        MsBuildProject::from_documents(doc, None, None)
    }

    #[test]
    fn test_config_condition_round_trip() {
        let condition = config_condition("Debug|x64");
        assert_eq!(condition, "'$(Configuration)|$(Platform)'=='Debug|x64'");
        assert_eq!(
            parse_config_condition(&condition),
            Some(("Debug".to_string(), "x64".to_string()))
        );
        assert_eq!(parse_config_condition("Exists('x')"), None);
    }

    #[test]
    fn test_queries() {
        let project = project();
        assert_eq!(project.format_version(), SchemaVersion::LATEST);
        assert_eq!(
            project.property("ProjectGuid"),
            "{B12702AD-ABFB-343A-A199-8E24837244A3}"
        );
        assert_eq!(project.property("Missing"), "");
        assert_eq!(project.item_property("ClCompile", "WarningLevel"), "Level3");
        assert_eq!(project.items("ClCompile"), vec!["main.cpp", "widget.cpp"]);

        let configs = project.configurations();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].configuration, "Release");
        assert_eq!(configs[1].platform, "x64");
    }

    #[test]
    fn test_report_path() {
        let project = project();
        assert_eq!(project.report_path(), "app.conversion.json");
    }

    #[test]
    fn test_enable_multi_processor_compilation_is_idempotent() {
        let mut project = project();
        project.enable_multi_processor_compilation();
        project.enable_multi_processor_compilation();
        assert_eq!(
            project.item_property("ClCompile", "MultiProcessorCompilation"),
            "true"
        );
        assert_eq!(project.journal().commits().len(), 1);
    }

    #[test]
    fn test_set_default_windows_sdk_version() {
        let mut project = project();
        assert!(project.set_default_windows_sdk_version("10.0"));
        assert!(project.set_default_windows_sdk_version("11.0"));
        assert_eq!(project.property("WindowsTargetPlatformVersion"), "10.0");
    }

    #[test]
    fn test_add_build_system_references() {
        let mut project = project();
        assert!(project.add_build_system_references());
        let root = project.root();
        let props = root.position(|c| imports(c, QT_PROPS)).unwrap();
        let targets = root.position(|c| imports(c, QT_TARGETS)).unwrap();
        assert!(props < targets);
        assert_eq!(project.property("QtMsBuild"), r"$(MSBuildProjectDirectory)\QtMsBuild");

        // Second call finds the import and does nothing
        assert!(project.add_build_system_references());
        assert_eq!(project.journal().commits().len(), 1);
    }

    #[test]
    fn test_add_build_system_references_needs_anchors() {
        let doc = StructuredDocument::parse("a.vcxproj", "<Project><ItemGroup /></Project>").unwrap();
        let mut project = MsBuildProject::from_documents(doc, None, None);
        assert!(!project.add_build_system_references());
        assert!(project.journal().commits().is_empty());
    }
}
