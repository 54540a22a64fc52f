//! Static repository analysis.
//!
//! [`StaticAnalyzer`] derives an [`AnalysisSummary`] from file paths,
//! manifests and light content scans. No parsing, no metrics beyond simple
//! counts: the summary only needs to be good enough to seed a walkthrough.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use codequest_core::models::{RepositoryRef, SourceFile};

use crate::fetch::KEY_FILES;

/// Analysis of one fetched repository.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisSummary {
    pub repo_id: String,
    /// Code languages with their file counts, most common first.
    pub languages: Vec<LanguageShare>,
    pub frameworks: Vec<String>,
    pub architecture_pattern: String,
    pub entry_points: Vec<EntryPoint>,
    pub key_files: Vec<String>,
    pub key_components: Vec<Component>,
    pub dependencies: Vec<Dependency>,
    pub code_quality: CodeQuality,
    /// 0 to 100.
    pub complexity_score: u32,
    pub learning_path: Vec<LearningStep>,
}

impl AnalysisSummary {
    pub fn primary_language(&self) -> Option<&str> {
        self.languages.first().map(|l| l.language.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LanguageShare {
    pub language: String,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryPoint {
    pub file: String,
    pub kind: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Component {
    pub file: String,
    pub language: String,
    pub kind: String,
    pub complexity: u32,
    pub imports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
    pub ecosystem: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CodeQuality {
    pub has_documentation: bool,
    /// Share of files that look like tests, as a percentage capped at 90.
    pub test_file_ratio: u32,
    pub organized: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningStep {
    pub step: u32,
    pub title: String,
    pub description: String,
    pub difficulty: String,
    pub estimated_time: String,
    pub focus_files: Vec<String>,
}

/// Produces an analysis summary from fetched files.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, repo: &RepositoryRef, files: &[SourceFile]) -> Result<AnalysisSummary>;
}

/// Path and manifest heuristics.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticAnalyzer;

const NON_CODE: &[&str] = &[
    "text", "markdown", "json", "yaml", "toml", "dockerfile", "makefile", "html", "css",
];

const ENTRY_POINTS: &[(&str, &str)] = &[
    ("main.rs", "Rust binary"),
    ("lib.rs", "Rust library root"),
    ("main.py", "Python main"),
    ("app.py", "Flask app"),
    ("manage.py", "Django management"),
    ("main.go", "Go main"),
    ("index.js", "JavaScript entry"),
    ("index.ts", "TypeScript entry"),
    ("server.js", "Node.js server"),
    ("main.js", "JavaScript main"),
    ("App.js", "React app"),
    ("App.tsx", "React app (TypeScript)"),
    ("layout.tsx", "Next.js layout"),
    ("page.tsx", "Next.js page"),
    ("Main.java", "Java main"),
];

impl Analyzer for StaticAnalyzer {
    fn analyze(&self, repo: &RepositoryRef, files: &[SourceFile]) -> Result<AnalysisSummary> {
        let code_files: Vec<&SourceFile> = files
            .iter()
            .filter(|f| !NON_CODE.contains(&f.language.as_str()))
            .collect();

        let languages = language_shares(&code_files);
        let key_files: Vec<String> = files
            .iter()
            .filter(|f| KEY_FILES.contains(&file_name(&f.path)))
            .map(|f| f.path.clone())
            .collect();
        let dependencies = extract_dependencies(files);
        let frameworks = detect_frameworks(files, &dependencies);
        let architecture_pattern = detect_architecture(&code_files, &frameworks);
        let entry_points = find_entry_points(files);
        let key_components = rank_components(&code_files);
        let code_quality = assess_quality(files, &code_files);

        let complexity_score = ((code_files.len() / 5).min(20)
            + languages.len() * 2
            + frameworks.len() * 3
            + key_files.len() * 2)
            .min(100) as u32;

        let mut summary = AnalysisSummary {
            repo_id: repo.id.clone(),
            languages,
            frameworks,
            architecture_pattern,
            entry_points,
            key_files,
            key_components,
            dependencies,
            code_quality,
            complexity_score,
            learning_path: Vec::new(),
        };
        summary.learning_path = learning_path(&summary);
        Ok(summary)
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn language_shares(code_files: &[&SourceFile]) -> Vec<LanguageShare> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for f in code_files {
        *counts.entry(f.language.as_str()).or_default() += 1;
    }
    let mut shares: Vec<LanguageShare> = counts
        .into_iter()
        .map(|(language, files)| LanguageShare {
            language: language.to_string(),
            files,
        })
        .collect();
    shares.sort_by(|a, b| b.files.cmp(&a.files).then_with(|| a.language.cmp(&b.language)));
    shares
}

fn extract_dependencies(files: &[SourceFile]) -> Vec<Dependency> {
    let mut deps = Vec::new();
    for file in files {
        match file_name(&file.path) {
            "package.json" => {
                let Ok(json) = serde_json::from_str::<serde_json::Value>(&file.content) else {
                    continue;
                };
                for section in ["dependencies", "devDependencies"] {
                    if let Some(map) = json.get(section).and_then(|d| d.as_object()) {
                        for (name, version) in map {
                            if name.starts_with("@types/") {
                                continue;
                            }
                            deps.push(Dependency {
                                name: name.clone(),
                                version: version.as_str().unwrap_or("*").to_string(),
                                ecosystem: "npm".to_string(),
                            });
                        }
                    }
                }
            }
            "requirements.txt" => {
                for line in file.content.lines().map(str::trim) {
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let (name, version) = match line.split_once("==") {
                        Some((n, v)) => (n.trim(), v.trim()),
                        None => (line, "latest"),
                    };
                    deps.push(Dependency {
                        name: name.to_string(),
                        version: version.to_string(),
                        ecosystem: "python".to_string(),
                    });
                }
            }
            "Cargo.toml" => {
                let Ok(manifest) = file.content.parse::<toml::Table>() else {
                    continue;
                };
                if let Some(table) = manifest.get("dependencies").and_then(|d| d.as_table()) {
                    for (name, spec) in table {
                        let version = match spec {
                            toml::Value::String(v) => v.clone(),
                            toml::Value::Table(t) => t
                                .get("version")
                                .and_then(|v| v.as_str())
                                .unwrap_or("*")
                                .to_string(),
                            _ => "*".to_string(),
                        };
                        deps.push(Dependency {
                            name: name.clone(),
                            version,
                            ecosystem: "cargo".to_string(),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    deps
}

fn detect_frameworks(files: &[SourceFile], deps: &[Dependency]) -> Vec<String> {
    const KNOWN: &[(&str, &str)] = &[
        ("react", "React"),
        ("next", "Next.js"),
        ("express", "Express.js"),
        ("vue", "Vue.js"),
        ("django", "Django"),
        ("flask", "Flask"),
        ("fastapi", "FastAPI"),
        ("axum", "Axum"),
        ("actix-web", "Actix Web"),
        ("rocket", "Rocket"),
        ("tokio", "Tokio"),
    ];

    let mut found = BTreeSet::new();
    for dep in deps {
        let name = dep.name.to_ascii_lowercase();
        if let Some((_, label)) = KNOWN.iter().find(|(key, _)| *key == name) {
            found.insert(label.to_string());
        }
    }
    for f in files {
        let path = f.path.to_ascii_lowercase();
        let jsx = matches!(f.language.as_str(), "jsx" | "tsx");
        if jsx && path.contains("components/") {
            found.insert("React".to_string());
        }
        if jsx && path.contains("pages/") {
            found.insert("Next.js".to_string());
        }
    }
    found.into_iter().collect()
}

fn detect_architecture(code_files: &[&SourceFile], frameworks: &[String]) -> String {
    let has = |needle: &str| code_files.iter().any(|f| f.path.contains(needle));
    let uses = |name: &str| frameworks.iter().any(|f| f == name);

    if uses("Next.js") || uses("React") {
        if has("pages/") {
            return if has("app/") {
                "Next.js App Router".to_string()
            } else {
                "Next.js Pages Router".to_string()
            };
        }
        return "React SPA".to_string();
    }
    if uses("Flask") {
        return if has("models/") && has("views/") {
            "Flask MVC".to_string()
        } else {
            "Flask Microservice".to_string()
        };
    }
    if uses("Django") {
        return "Django MVT".to_string();
    }
    if has("models/") && (has("views/") || has("controllers/") || has("handlers/")) {
        return "MVC Architecture".to_string();
    }
    if has("components/") {
        return "Component-Based Architecture".to_string();
    }
    if has("crates/") || has("packages/") {
        return "Multi-package Workspace".to_string();
    }
    "Monolithic".to_string()
}

fn find_entry_points(files: &[SourceFile]) -> Vec<EntryPoint> {
    let mut entries = Vec::new();
    for f in files {
        let name = file_name(&f.path);
        if let Some((_, kind)) = ENTRY_POINTS.iter().find(|(n, _)| *n == name) {
            entries.push(EntryPoint {
                file: f.path.clone(),
                kind: kind.to_string(),
                language: f.language.clone(),
            });
        } else if name == "package.json" && f.content.contains("\"scripts\"") {
            entries.push(EntryPoint {
                file: f.path.clone(),
                kind: "Package scripts".to_string(),
                language: f.language.clone(),
            });
        }
    }
    // Shallow paths first: src/main.rs before examples/foo/main.rs.
    entries.sort_by_key(|e| (e.file.matches('/').count(), e.file.clone()));
    entries
}

fn classify(file: &SourceFile) -> Option<&'static str> {
    let path = file.path.to_ascii_lowercase();
    let dir_kinds = [
        ("components/", "UI component"),
        ("models/", "Data model"),
        ("views/", "View"),
        ("pages/", "View"),
        ("controllers/", "Controller"),
        ("handlers/", "Controller"),
        ("services/", "Service"),
        ("utils/", "Utility"),
        ("helpers/", "Utility"),
        ("api/", "API endpoint"),
        ("tests/", "Test"),
    ];
    if let Some((_, kind)) = dir_kinds.iter().find(|(dir, _)| path.contains(dir)) {
        return Some(kind);
    }
    if path.contains("test") {
        return Some("Test");
    }
    let content = &file.content;
    if content.contains("struct ") || content.contains("class ") {
        Some("Type definitions")
    } else if content.contains("fn ") || content.contains("def ") || content.contains("function ") {
        Some("Function collection")
    } else if content.contains("export default") || content.contains("export const") {
        Some("Module")
    } else {
        None
    }
}

fn file_complexity(file: &SourceFile) -> u32 {
    let c = &file.content;
    let lines = c.lines().count() as u32;
    let mut score = (lines / 10).min(10);
    score += (c.matches("class ").count() + c.matches("struct ").count() + c.matches("impl ").count()) as u32 * 3;
    score += (c.matches("fn ").count() + c.matches("def ").count() + c.matches("function ").count()) as u32 * 2;
    score += (c.matches("if ").count() + c.matches("for ").count() + c.matches("while ").count()
        + c.matches("match ").count()) as u32;
    score.min(50)
}

fn extract_imports(file: &SourceFile) -> Vec<String> {
    let mut imports = BTreeSet::new();
    for line in file.content.lines().map(str::trim_start) {
        let target = if let Some(rest) = line.strip_prefix("use ") {
            rest.split([':', ';', ' ', '{']).next()
        } else if let Some(rest) = line.strip_prefix("from ") {
            rest.split_whitespace().next()
        } else if let Some(rest) = line.strip_prefix("import ") {
            match rest.rsplit_once(" from ") {
                Some((_, module)) => Some(module.trim_matches(|c| c == '\'' || c == '"' || c == ';')),
                None => rest.split([' ', ',', ';']).next(),
            }
        } else if let Some(idx) = line.find("require(") {
            line[idx + 8..]
                .split(')')
                .next()
                .map(|m| m.trim_matches(|c| c == '\'' || c == '"'))
        } else {
            None
        };
        if let Some(t) = target.filter(|t| !t.is_empty()) {
            imports.insert(t.to_string());
        }
    }
    imports.into_iter().collect()
}

fn rank_components(code_files: &[&SourceFile]) -> Vec<Component> {
    let mut components: Vec<Component> = code_files
        .iter()
        .filter_map(|f| {
            classify(f).map(|kind| Component {
                file: f.path.clone(),
                language: f.language.clone(),
                kind: kind.to_string(),
                complexity: file_complexity(f),
                imports: extract_imports(f),
            })
        })
        .collect();
    components.sort_by(|a, b| b.complexity.cmp(&a.complexity).then_with(|| a.file.cmp(&b.file)));
    components.truncate(20);
    components
}

fn assess_quality(files: &[SourceFile], code_files: &[&SourceFile]) -> CodeQuality {
    let has_documentation = files
        .iter()
        .any(|f| file_name(&f.path) == "README.md" || f.path.starts_with("docs/"));
    let tests = code_files
        .iter()
        .filter(|f| f.path.to_ascii_lowercase().contains("test"))
        .count();
    let test_file_ratio = if code_files.is_empty() {
        0
    } else {
        ((tests * 100 / code_files.len()) as u32).min(90)
    };
    let organized = code_files.iter().any(|f| {
        ["components/", "services/", "models/", "src/"]
            .iter()
            .any(|dir| f.path.contains(dir))
    });
    CodeQuality {
        has_documentation,
        test_file_ratio,
        organized,
    }
}

fn learning_path(summary: &AnalysisSummary) -> Vec<LearningStep> {
    let mut steps = vec![LearningStep {
        step: 1,
        title: "Repository Overview".to_string(),
        description: format!("Understand the {} architecture", summary.architecture_pattern),
        difficulty: "Beginner".to_string(),
        estimated_time: "10-15 minutes".to_string(),
        focus_files: summary.key_files.clone(),
    }];
    if !summary.entry_points.is_empty() {
        steps.push(LearningStep {
            step: 2,
            title: "Application Entry Points".to_string(),
            description: "Explore how the application starts and wires its main components".to_string(),
            difficulty: "Beginner".to_string(),
            estimated_time: "15-20 minutes".to_string(),
            focus_files: summary.entry_points.iter().take(3).map(|e| e.file.clone()).collect(),
        });
    }
    if !summary.key_components.is_empty() {
        steps.push(LearningStep {
            step: 3,
            title: "Core Components Deep Dive".to_string(),
            description: "Understand the main business logic and components".to_string(),
            difficulty: "Intermediate".to_string(),
            estimated_time: "30-45 minutes".to_string(),
            focus_files: summary.key_components.iter().take(5).map(|c| c.file.clone()).collect(),
        });
    }
    if !summary.dependencies.is_empty() {
        steps.push(LearningStep {
            step: 4,
            title: "Dependencies and Integration".to_string(),
            description: "Understand external dependencies and how they integrate".to_string(),
            difficulty: "Intermediate".to_string(),
            estimated_time: "20-30 minutes".to_string(),
            focus_files: Vec::new(),
        });
    }
    steps.push(LearningStep {
        step: 5,
        title: "Advanced Patterns and Architecture".to_string(),
        description: "Explore advanced patterns and architectural decisions".to_string(),
        difficulty: "Advanced".to_string(),
        estimated_time: "45-60 minutes".to_string(),
        focus_files: Vec::new(),
    });
    steps
}
