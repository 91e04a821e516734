// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Where a skill was discovered.  Earlier sources win on name collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillSource {
    Project,
    Personal,
    Plugin,
    LegacyProject,
    LegacyPersonal,
}

impl SkillSource {
    pub fn is_legacy(self) -> bool {
        matches!(self, Self::LegacyProject | Self::LegacyPersonal)
    }
}

/// Metadata for one discovered skill.
#[derive(Debug, Clone)]
pub struct SkillMetadata {
    /// Skill name, optionally namespaced `plugin:name`.
    pub name: String,
    pub description: String,
    pub argument_hint: Option<String>,
    pub user_invocable: bool,
    pub allowed_tools: Vec<String>,
    pub source: SkillSource,
    pub file_path: PathBuf,
}

/// Filesystem roots that discovery scans.
#[derive(Debug, Clone)]
pub struct DiscoveryPaths {
    pub project_dir: PathBuf,
    pub personal_skills_dir: PathBuf,
    pub personal_commands_dir: PathBuf,
    /// The shared plugin registry (`installed_plugins.json`).
    pub plugins_registry: PathBuf,
    /// Settings file that may carry an `enabledPlugins` map.
    pub settings: PathBuf,
}

// ── Frontmatter ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct RawFrontmatter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "argument-hint")]
    argument_hint: Option<String>,
    #[serde(default, rename = "user-invocable")]
    user_invocable: Option<bool>,
    #[serde(default, rename = "allowed-tools")]
    allowed_tools: Option<Vec<String>>,
}

/// Split optional YAML frontmatter from a skill body.
///
/// Returns `(frontmatter, body)`.  Missing or malformed frontmatter
/// yields `None` with the original content as the body.
fn parse_frontmatter(content: &str) -> (Option<RawFrontmatter>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (None, content);
    };
    let Some(close) = rest.find("\n---") else {
        return (None, content);
    };
    let yaml_block = &rest[..close];
    let body = rest[close + 4..].trim_start_matches('\n');

    match serde_yaml::from_str::<RawFrontmatter>(yaml_block) {
        Ok(fm) => (Some(fm), body),
        Err(e) => {
            warn!(error = %e, "failed to parse skill frontmatter");
            (None, content)
        }
    }
}

// ── Directory scanning ────────────────────────────────────────────────────────

fn load_skill_file(
    skill_file: &Path,
    source: SkillSource,
    name_prefix: &str,
) -> Option<SkillMetadata> {
    let content = match std::fs::read_to_string(skill_file) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %skill_file.display(), error = %e, "failed to read skill file");
            return None;
        }
    };

    let (frontmatter, _) = parse_frontmatter(&content);
    let Some(fm) = frontmatter else {
        warn!(path = %skill_file.display(), "skill missing or malformed frontmatter — skipping");
        return None;
    };

    // Default per the Agent Skills convention: invocable unless opted out.
    if !fm.user_invocable.unwrap_or(true) {
        return None;
    }

    let dir_name = skill_file
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let raw_name = fm.name.filter(|n| !n.trim().is_empty()).unwrap_or(dir_name);
    let name = if name_prefix.is_empty() {
        raw_name
    } else {
        format!("{name_prefix}{raw_name}")
    };

    Some(SkillMetadata {
        name,
        description: fm.description.unwrap_or_default(),
        argument_hint: fm.argument_hint,
        user_invocable: true,
        allowed_tools: fm.allowed_tools.unwrap_or_default(),
        source,
        file_path: skill_file.to_path_buf(),
    })
}

/// Scan a skills directory for `SKILL.md` files.  `recursive` enables the
/// monorepo layout (project skills); flat scans only look at direct child
/// directories.
fn scan_skills_dir(
    dir: &Path,
    source: SkillSource,
    recursive: bool,
    name_prefix: &str,
) -> Vec<SkillMetadata> {
    let mut skills = Vec::new();
    if !dir.is_dir() {
        return skills;
    }
    scan_skills_inner(dir, source, recursive, name_prefix, &mut skills);
    skills
}

fn scan_skills_inner(
    dir: &Path,
    source: SkillSource,
    recursive: bool,
    name_prefix: &str,
    out: &mut Vec<SkillMetadata>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let child = entry.path();
        if !child.is_dir() {
            continue;
        }
        let skill_file = child.join("SKILL.md");
        if skill_file.is_file() {
            if let Some(skill) = load_skill_file(&skill_file, source, name_prefix) {
                out.push(skill);
            }
        }
        if recursive {
            scan_skills_inner(&child, source, recursive, name_prefix, out);
        }
    }
}

/// Scan a legacy commands directory: every flat `.md` file is a command
/// with no frontmatter and an empty description.
fn scan_legacy_commands_dir(dir: &Path, source: SkillSource) -> Vec<SkillMetadata> {
    let mut skills = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return skills;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let is_md = path.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("md"));
        if !is_md {
            continue;
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        skills.push(SkillMetadata {
            name,
            description: String::new(),
            argument_hint: None,
            user_invocable: true,
            allowed_tools: Vec::new(),
            source,
            file_path: path,
        });
    }
    skills
}

// ── Plugin registry ───────────────────────────────────────────────────────────

/// The `enabledPlugins` map from the settings file, if present.
fn read_enabled_plugins(settings: &Path) -> Option<Value> {
    let content = std::fs::read_to_string(settings).ok()?;
    serde_json::from_str::<Value>(&content)
        .ok()?
        .get("enabledPlugins")
        .cloned()
}

/// Skills directories of enabled plugin installations, paired with the
/// plugin's namespace prefix (the key before `@`).
fn plugin_skill_dirs(registry: &Path, settings: &Path) -> Vec<(PathBuf, String)> {
    let Ok(content) = std::fs::read_to_string(registry) else {
        return Vec::new();
    };
    let data: Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %registry.display(), error = %e, "failed to parse plugin registry");
            return Vec::new();
        }
    };

    let enabled = read_enabled_plugins(settings);
    let Some(plugins) = data.get("plugins").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut result = Vec::new();
    for (plugin_key, installations) in plugins {
        let Some(installations) = installations.as_array() else {
            continue;
        };

        // Default allow when no enabledPlugins map exists.
        let is_enabled = enabled
            .as_ref()
            .and_then(|m| m.get(plugin_key))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !is_enabled {
            debug!(plugin = plugin_key, "skipping disabled plugin");
            continue;
        }

        let plugin_name = plugin_key.split('@').next().unwrap_or(plugin_key);
        for install in installations {
            let Some(install_path) = install.get("installPath").and_then(Value::as_str) else {
                continue;
            };
            let skills_dir = Path::new(install_path).join("skills");
            if skills_dir.is_dir() {
                result.push((skills_dir, plugin_name.to_string()));
            }
        }
    }
    result
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Discover skills from all sources, deduplicating by name with earlier
/// sources taking precedence.
pub fn discover_skills(paths: &DiscoveryPaths) -> Vec<SkillMetadata> {
    let mut all = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let mut add = |skills: Vec<SkillMetadata>, all: &mut Vec<SkillMetadata>| {
        for skill in skills {
            if seen.insert(skill.name.clone()) {
                all.push(skill);
            }
        }
    };

    // 1. Project skills (recursive for monorepo support).
    add(
        scan_skills_dir(
            &paths.project_dir.join(".claude").join("skills"),
            SkillSource::Project,
            true,
            "",
        ),
        &mut all,
    );

    // 2. Personal skills (direct children only).
    add(
        scan_skills_dir(&paths.personal_skills_dir, SkillSource::Personal, false, ""),
        &mut all,
    );

    // 3. Plugin skills, namespaced and filtered by enabledPlugins.
    for (dir, plugin_name) in plugin_skill_dirs(&paths.plugins_registry, &paths.settings) {
        add(
            scan_skills_dir(&dir, SkillSource::Plugin, false, &format!("{plugin_name}:")),
            &mut all,
        );
    }

    // 4-5. Legacy command directories.
    add(
        scan_legacy_commands_dir(
            &paths.project_dir.join(".claude").join("commands"),
            SkillSource::LegacyProject,
        ),
        &mut all,
    );
    add(
        scan_legacy_commands_dir(&paths.personal_commands_dir, SkillSource::LegacyPersonal),
        &mut all,
    );

    info!(count = all.len(), "discovered skills");
    all
}

/// Load a skill's full body, stripping frontmatter for modern skills.
/// Legacy commands pass through verbatim.  Returns an empty string when
/// the file cannot be read.
pub fn load_skill_body(skill: &SkillMetadata) -> String {
    let content = match std::fs::read_to_string(&skill.file_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(skill = %skill.name, path = %skill.file_path.display(), error = %e, "failed to load skill body");
            return String::new();
        }
    };
    if skill.source.is_legacy() {
        return content;
    }
    let (_, body) = parse_frontmatter(&content);
    body.to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn paths(tmp: &TempDir) -> DiscoveryPaths {
        DiscoveryPaths {
            project_dir: tmp.path().join("project"),
            personal_skills_dir: tmp.path().join("personal/skills"),
            personal_commands_dir: tmp.path().join("personal/commands"),
            plugins_registry: tmp.path().join("plugins/installed_plugins.json"),
            settings: tmp.path().join("settings.json"),
        }
    }

    fn write_skill(root: &Path, name: &str, frontmatter: &str, body: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("SKILL.md"), format!("---\n{frontmatter}---\n\n{body}")).unwrap();
    }

    // ── Frontmatter parsing ───────────────────────────────────────────────────

    #[test]
    fn frontmatter_fields_parse() {
        let content = "---\nname: deploy\ndescription: Ship it.\nargument-hint: \"[env]\"\nallowed-tools:\n  - Bash\n---\n\nBody.";
        let (fm, body) = parse_frontmatter(content);
        let fm = fm.unwrap();
        assert_eq!(fm.name.as_deref(), Some("deploy"));
        assert_eq!(fm.description.as_deref(), Some("Ship it."));
        assert_eq!(fm.argument_hint.as_deref(), Some("[env]"));
        assert_eq!(fm.allowed_tools.unwrap(), vec!["Bash"]);
        assert_eq!(body, "Body.");
    }

    #[test]
    fn missing_frontmatter_returns_full_content() {
        let content = "Just a body.";
        let (fm, body) = parse_frontmatter(content);
        assert!(fm.is_none());
        assert_eq!(body, content);
    }

    #[test]
    fn malformed_yaml_returns_none() {
        let content = "---\n: : bad: [unclosed\n---\nBody.";
        let (fm, _) = parse_frontmatter(content);
        assert!(fm.is_none());
    }

    // ── Project skills ────────────────────────────────────────────────────────

    #[test]
    fn discovers_project_skill_with_defaults() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_skill(
            &p.project_dir.join(".claude/skills"),
            "review",
            "description: Review code.\n",
            "Do the review.",
        );

        let skills = discover_skills(&p);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "review");
        assert_eq!(skills[0].description, "Review code.");
        assert_eq!(skills[0].source, SkillSource::Project);
        assert!(skills[0].user_invocable);
    }

    #[test]
    fn project_scan_is_recursive() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_skill(
            &p.project_dir.join(".claude/skills/nested/deeper"),
            "inner",
            "description: Nested.\n",
            "",
        );
        let skills = discover_skills(&p);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "inner");
    }

    #[test]
    fn personal_scan_is_flat() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_skill(&p.personal_skills_dir, "top", "description: Top.\n", "");
        write_skill(
            &p.personal_skills_dir.join("top/nested"),
            "hidden",
            "description: Too deep.\n",
            "",
        );
        let skills = discover_skills(&p);
        let names: Vec<&str> = skills.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"top"));
        assert!(!names.contains(&"hidden"));
    }

    #[test]
    fn non_invocable_skill_skipped() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_skill(
            &p.project_dir.join(".claude/skills"),
            "internal",
            "description: Hidden.\nuser-invocable: false\n",
            "",
        );
        assert!(discover_skills(&p).is_empty());
    }

    #[test]
    fn malformed_frontmatter_skips_skill() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        let dir = p.project_dir.join(".claude/skills/broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("SKILL.md"), "---\n: : [bad yaml\n---\nBody").unwrap();
        assert!(discover_skills(&p).is_empty());
    }

    #[test]
    fn name_falls_back_to_directory() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_skill(
            &p.project_dir.join(".claude/skills"),
            "dirname-wins",
            "description: No explicit name.\n",
            "",
        );
        assert_eq!(discover_skills(&p)[0].name, "dirname-wins");
    }

    // ── Precedence ────────────────────────────────────────────────────────────

    #[test]
    fn project_beats_personal_on_collision() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_skill(
            &p.project_dir.join(".claude/skills"),
            "deploy",
            "description: Project version.\n",
            "",
        );
        write_skill(
            &p.personal_skills_dir,
            "deploy",
            "description: Personal version.\n",
            "",
        );
        let skills = discover_skills(&p);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].description, "Project version.");
    }

    // ── Plugins ───────────────────────────────────────────────────────────────

    fn write_plugin(tmp: &TempDir, p: &DiscoveryPaths, key: &str, skill: &str) -> PathBuf {
        let install = tmp.path().join(format!("plugins/{key}"));
        write_skill(
            &install.join("skills"),
            skill,
            "description: Plugin skill.\n",
            "",
        );
        fs::create_dir_all(p.plugins_registry.parent().unwrap()).unwrap();
        let registry = serde_json::json!({
            "plugins": {
                key: [{"installPath": install.display().to_string(), "version": "1.0.0"}]
            }
        });
        fs::write(&p.plugins_registry, registry.to_string()).unwrap();
        install
    }

    #[test]
    fn plugin_skills_are_namespaced() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_plugin(&tmp, &p, "superpowers@market", "brainstorm");

        let skills = discover_skills(&p);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "superpowers:brainstorm");
        assert_eq!(skills[0].source, SkillSource::Plugin);
    }

    #[test]
    fn disabled_plugin_skills_not_discovered() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_plugin(&tmp, &p, "superpowers@market", "brainstorm");
        fs::write(
            &p.settings,
            r#"{"enabledPlugins": {"superpowers@market": false}}"#,
        )
        .unwrap();
        assert!(discover_skills(&p).is_empty());
    }

    #[test]
    fn absent_enabled_map_defaults_to_allow() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_plugin(&tmp, &p, "tools@m", "helper");
        fs::write(&p.settings, r#"{"model": "opus"}"#).unwrap();
        assert_eq!(discover_skills(&p).len(), 1);
    }

    // ── Legacy commands ───────────────────────────────────────────────────────

    #[test]
    fn legacy_commands_discovered_without_frontmatter() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        let dir = p.project_dir.join(".claude/commands");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("fix-ci.md"), "Fix the CI for $ARGUMENTS").unwrap();

        let skills = discover_skills(&p);
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "fix-ci");
        assert_eq!(skills[0].source, SkillSource::LegacyProject);
        assert!(skills[0].description.is_empty());
    }

    // ── Body loading ──────────────────────────────────────────────────────────

    #[test]
    fn load_body_strips_frontmatter() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        write_skill(
            &p.project_dir.join(".claude/skills"),
            "x",
            "description: D.\n",
            "The body with $ARGUMENTS.",
        );
        let skills = discover_skills(&p);
        let body = load_skill_body(&skills[0]);
        assert_eq!(body, "The body with $ARGUMENTS.");
        assert!(!body.contains("description"));
    }

    #[test]
    fn load_body_keeps_legacy_verbatim() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        let dir = p.personal_commands_dir.clone();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("go.md"), "---\nnot frontmatter\n---\ncontent").unwrap();

        let skills = discover_skills(&p);
        let body = load_skill_body(&skills[0]);
        assert!(body.starts_with("---"));
    }

    #[test]
    fn load_body_missing_file_is_empty() {
        let skill = SkillMetadata {
            name: "gone".into(),
            description: String::new(),
            argument_hint: None,
            user_invocable: true,
            allowed_tools: Vec::new(),
            source: SkillSource::Project,
            file_path: PathBuf::from("/nonexistent/SKILL.md"),
        };
        assert!(load_skill_body(&skill).is_empty());
    }
}
