//! Immutable catalogue of runnable languages.
//!
//! The registry is built once at startup, either from the built-in catalogue
//! or from a JSON file, and is shared read-only afterwards.

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageProfile {
    pub id: String,
    pub display_name: String,
    pub extension: String,
    #[serde(default)]
    pub default_entry: Option<String>,
    /// Optional compile step; argv template.
    #[serde(default)]
    pub build: Option<Vec<String>>,
    pub run: Vec<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_build_timeout_ms")]
    pub build_timeout_ms: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_build_memory_mb")]
    pub build_memory_mb: u64,
    #[serde(default)]
    pub sample_code: String,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_build_timeout_ms() -> u64 {
    20_000
}

fn default_memory_mb() -> u64 {
    256
}

fn default_build_memory_mb() -> u64 {
    1024
}

/// Values substituted into `{placeholder}` tokens of a command template.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub dir: String,
    pub entry: String,
    pub memory_mb: u64,
}

impl TemplateVars {
    pub fn stem(&self) -> &str {
        match self.entry.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.entry,
        }
    }
}

pub fn render_template(template: &[String], vars: &TemplateVars) -> Vec<String> {
    let source = format!("{}/{}", vars.dir.trim_end_matches('/'), vars.entry);
    template
        .iter()
        .map(|token| {
            token
                .replace("{source}", &source)
                .replace("{dir}", vars.dir.trim_end_matches('/'))
                .replace("{entry}", &vars.entry)
                .replace("{stem}", vars.stem())
                .replace("{memory_mb}", &vars.memory_mb.to_string())
        })
        .collect()
}

impl LanguageProfile {
    pub fn default_entry(&self) -> String {
        self.default_entry
            .clone()
            .unwrap_or_else(|| format!("main.{}", self.extension))
    }

    pub fn is_compiled(&self) -> bool {
        self.build.is_some()
    }

    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or("debian:stable-slim")
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            bail!("language id must not be empty");
        }
        if self.extension.trim().is_empty() || self.extension.contains('.') {
            bail!("language {} has an invalid extension", self.id);
        }
        if self.run.is_empty() {
            bail!("language {} has an empty run command", self.id);
        }
        if matches!(&self.build, Some(cmd) if cmd.is_empty()) {
            bail!("language {} has an empty build command", self.id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageSummary {
    pub id: String,
    pub display_name: String,
    pub extension: String,
    pub default_entry: String,
    pub compiled: bool,
    pub sample_code: String,
}

impl From<&LanguageProfile> for LanguageSummary {
    fn from(profile: &LanguageProfile) -> Self {
        Self {
            id: profile.id.clone(),
            display_name: profile.display_name.clone(),
            extension: profile.extension.clone(),
            default_entry: profile.default_entry(),
            compiled: profile.is_compiled(),
            sample_code: profile.sample_code.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<String, Arc<LanguageProfile>>,
    order: Vec<String>,
}

impl LanguageRegistry {
    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> anyhow::Result<Self> {
        if profiles.is_empty() {
            bail!("language registry must contain at least one profile");
        }
        let mut map = HashMap::with_capacity(profiles.len());
        let mut order = Vec::with_capacity(profiles.len());
        for profile in profiles {
            profile.validate()?;
            let id = profile.id.to_ascii_lowercase();
            if map.contains_key(&id) {
                return Err(anyhow!("duplicate language id: {id}"));
            }
            order.push(id.clone());
            map.insert(id, Arc::new(profile));
        }
        Ok(Self {
            profiles: map,
            order,
        })
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let profiles: Vec<LanguageProfile> =
                    serde_json::from_str(&raw).context("invalid language catalogue")?;
                Self::from_profiles(profiles)
            }
            None => Ok(Self::builtin()),
        }
    }

    pub fn builtin() -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for profile in builtin_profiles() {
            order.push(profile.id.clone());
            map.insert(profile.id.clone(), Arc::new(profile));
        }
        Self {
            profiles: map,
            order,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<LanguageProfile>> {
        self.profiles.get(&id.to_ascii_lowercase()).cloned()
    }

    pub fn by_extension(&self, extension: &str) -> Option<Arc<LanguageProfile>> {
        self.iter()
            .find(|profile| profile.extension.eq_ignore_ascii_case(extension))
    }

    /// Language implied by a file name's extension.
    pub fn for_file_name(&self, name: &str) -> Option<Arc<LanguageProfile>> {
        let (_, ext) = name.rsplit_once('.')?;
        self.by_extension(ext)
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<LanguageProfile>> + '_ {
        self.order.iter().filter_map(|id| self.profiles.get(id).cloned())
    }

    pub fn summaries(&self) -> Vec<LanguageSummary> {
        self.iter().map(|p| LanguageSummary::from(p.as_ref())).collect()
    }
}

fn argv(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

fn builtin_profiles() -> Vec<LanguageProfile> {
    vec![
        LanguageProfile {
            id: "python".into(),
            display_name: "Python".into(),
            extension: "py".into(),
            default_entry: None,
            build: None,
            run: argv(&["python3", "-I", "-u", "{source}"]),
            image: Some("python:3.12-alpine".into()),
            timeout_ms: 5_000,
            build_timeout_ms: default_build_timeout_ms(),
            memory_mb: 256,
            build_memory_mb: default_build_memory_mb(),
            sample_code: "print(\"Hello, World!\")".into(),
        },
        LanguageProfile {
            id: "java".into(),
            display_name: "Java".into(),
            extension: "java".into(),
            default_entry: Some("Main.java".into()),
            build: Some(argv(&["javac", "-J-Xss8m", "-d", "{dir}", "{source}"])),
            run: argv(&[
                "java",
                "-XX:+UseSerialGC",
                "-XX:MaxRAM={memory_mb}m",
                "-cp",
                "{dir}",
                "{stem}",
            ]),
            image: Some("eclipse-temurin:21-jdk".into()),
            timeout_ms: 10_000,
            build_timeout_ms: 30_000,
            memory_mb: 512,
            build_memory_mb: 2048,
            sample_code: "public class Main {\n    public static void main(String[] args) {\n        System.out.println(\"Hello, World!\");\n    }\n}".into(),
        },
        LanguageProfile {
            id: "c".into(),
            display_name: "C".into(),
            extension: "c".into(),
            default_entry: None,
            build: Some(argv(&["gcc", "-O2", "-std=c17", "-o", "{dir}/{stem}", "{source}", "-lm"])),
            run: argv(&["{dir}/{stem}"]),
            image: Some("gcc:14".into()),
            timeout_ms: 5_000,
            build_timeout_ms: 20_000,
            memory_mb: 256,
            build_memory_mb: 1024,
            sample_code: "#include <stdio.h>\n\nint main() {\n    printf(\"Hello, World!\\n\");\n    return 0;\n}".into(),
        },
        LanguageProfile {
            id: "javascript".into(),
            display_name: "JavaScript".into(),
            extension: "js".into(),
            default_entry: None,
            build: None,
            run: argv(&["node", "--max-old-space-size={memory_mb}", "{source}"]),
            image: Some("node:22-alpine".into()),
            timeout_ms: 5_000,
            build_timeout_ms: default_build_timeout_ms(),
            memory_mb: 512,
            build_memory_mb: default_build_memory_mb(),
            sample_code: "console.log(\"Hello, World!\");".into(),
        },
        LanguageProfile {
            id: "ruby".into(),
            display_name: "Ruby".into(),
            extension: "rb".into(),
            default_entry: None,
            build: None,
            run: argv(&["ruby", "{source}"]),
            image: Some("ruby:3.3-alpine".into()),
            timeout_ms: 5_000,
            build_timeout_ms: default_build_timeout_ms(),
            memory_mb: 256,
            build_memory_mb: default_build_memory_mb(),
            sample_code: "puts \"Hello, World!\"".into(),
        },
        LanguageProfile {
            id: "rust".into(),
            display_name: "Rust".into(),
            extension: "rs".into(),
            default_entry: None,
            build: Some(argv(&["rustc", "-O", "--edition", "2021", "-o", "{dir}/{stem}", "{source}"])),
            run: argv(&["{dir}/{stem}"]),
            image: Some("rust:1.82-alpine".into()),
            timeout_ms: 5_000,
            build_timeout_ms: 60_000,
            memory_mb: 256,
            build_memory_mb: 2048,
            sample_code: "fn main() {\n    println!(\"Hello, World!\");\n}".into(),
        },
    ]
}

/// Profile that runs its source with `/bin/sh`; used by tests that must not
/// depend on installed toolchains.
#[cfg(test)]
pub(crate) fn shell_profile() -> LanguageProfile {
    LanguageProfile {
        id: "sh".into(),
        display_name: "Shell".into(),
        extension: "sh".into(),
        default_entry: None,
        build: None,
        run: argv(&["/bin/sh", "{source}"]),
        image: Some("alpine:3".into()),
        timeout_ms: 5_000,
        build_timeout_ms: 5_000,
        memory_mb: 256,
        build_memory_mb: 256,
        sample_code: "echo hello".into(),
    }
}

/// Like [`shell_profile`] but with a build step that copies the source.
#[cfg(test)]
pub(crate) fn compiled_shell_profile() -> LanguageProfile {
    LanguageProfile {
        id: "shc".into(),
        display_name: "Compiled shell".into(),
        extension: "shc".into(),
        default_entry: None,
        build: Some(argv(&["/bin/sh", "-c", "grep -q BROKEN \"$0\" && { echo 'syntax error' >&2; exit 2; }; cp \"$0\" \"$1\"", "{source}", "{dir}/{stem}.out"])),
        run: argv(&["/bin/sh", "{dir}/{stem}.out"]),
        image: None,
        timeout_ms: 5_000,
        build_timeout_ms: 5_000,
        memory_mb: 256,
        build_memory_mb: 256,
        sample_code: String::new(),
    }
}

#[cfg(test)]
pub(crate) fn test_registry() -> LanguageRegistry {
    let mut profiles = builtin_profiles();
    profiles.push(shell_profile());
    profiles.push(compiled_shell_profile());
    LanguageRegistry::from_profiles(profiles).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalogue_covers_editor_languages() {
        let registry = LanguageRegistry::builtin();
        for id in ["python", "java", "c", "javascript", "ruby", "rust"] {
            let profile = registry.get(id).unwrap();
            assert!(!profile.sample_code.is_empty(), "{id} lacks sample code");
        }
        assert_eq!(registry.get("Java").unwrap().default_entry(), "Main.java");
        assert_eq!(registry.get("python").unwrap().default_entry(), "main.py");
        assert_eq!(registry.by_extension("rb").unwrap().id, "ruby");
        assert_eq!(registry.for_file_name("util.js").unwrap().id, "javascript");
        assert!(registry.for_file_name("README").is_none());
    }

    #[test]
    fn renders_placeholders() {
        let vars = TemplateVars {
            dir: "/workspace/".into(),
            entry: "Main.java".into(),
            memory_mb: 128,
        };
        let profile = LanguageRegistry::builtin().get("java").unwrap();
        let run = render_template(&profile.run, &vars);
        assert_eq!(
            run,
            vec!["java", "-XX:+UseSerialGC", "-XX:MaxRAM=128m", "-cp", "/workspace", "Main"]
        );
        let build = render_template(profile.build.as_ref().unwrap(), &vars);
        assert_eq!(build.last().unwrap(), "/workspace/Main.java");
    }

    #[test]
    fn rejects_duplicate_and_empty_profiles() {
        let dup = LanguageRegistry::from_profiles(vec![shell_profile(), shell_profile()]);
        assert!(dup.is_err());

        let mut empty_run = shell_profile();
        empty_run.run.clear();
        assert!(LanguageRegistry::from_profiles(vec![empty_run]).is_err());
        assert!(LanguageRegistry::from_profiles(Vec::new()).is_err());
    }

    #[test]
    fn loads_catalogue_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        std::fs::write(
            &path,
            r#"[{"id":"lua","displayName":"Lua","extension":"lua","run":["lua","{source}"]}]"#,
        )
        .unwrap();
        let registry = LanguageRegistry::load(Some(&path)).unwrap();
        let lua = registry.get("lua").unwrap();
        assert_eq!(lua.timeout_ms, 5_000);
        assert_eq!(lua.default_entry(), "main.lua");
        assert!(registry.get("python").is_none());
    }
}
