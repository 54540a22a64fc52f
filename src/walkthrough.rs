//! Walkthrough synthesis.
//!
//! The walkthrough structure (modules, objectives, focus files, timing) is
//! always derived deterministically from the [`AnalysisSummary`], and each
//! module's quiz, snippets and activities from its focus files (see
//! [`crate::quiz`]). The model
//! selector contributes the narrative overview; when no model answers, the
//! templated overview is used and the walkthrough is flagged as a skeleton.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use codequest_core::models::{RepositoryRef, SourceFile};

use crate::analyze::{AnalysisSummary, LearningStep};
use crate::error::{Degradation, DegradationKind};
use crate::llm::{GenerationRequest, ModelSelector, Tier};
use crate::quiz::{self, Activity, CodeSnippet, FileIndex, QuizQuestion};

/// Audience the explanation is written for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl UserLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserLevel::Beginner => "beginner",
            UserLevel::Intermediate => "intermediate",
            UserLevel::Advanced => "advanced",
        }
    }
}

impl fmt::Display for UserLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "beginner" => Ok(UserLevel::Beginner),
            "intermediate" => Ok(UserLevel::Intermediate),
            "advanced" => Ok(UserLevel::Advanced),
            other => Err(format!(
                "invalid user level '{other}': must be beginner, intermediate, or advanced"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Difficulty {
    pub level: String,
    pub complexity_score: u32,
    pub user_level: UserLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearningModule {
    pub id: String,
    pub title: String,
    pub description: String,
    pub difficulty: String,
    pub estimated_time: String,
    pub objectives: Vec<String>,
    pub focus_files: Vec<String>,
    pub snippets: Vec<CodeSnippet>,
    pub activities: Vec<Activity>,
    pub quiz: Vec<QuizQuestion>,
    /// Only the first module starts unlocked.
    pub unlocked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Walkthrough {
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub estimated_time: String,
    pub modules: Vec<LearningModule>,
    pub generated_by: Tier,
    pub backend: String,
    /// True when no model contributed and the overview is templated.
    pub skeleton: bool,
}

/// Builds walkthroughs through the model selector.
pub struct WalkthroughGenerator {
    selector: Arc<ModelSelector>,
}

impl WalkthroughGenerator {
    pub fn new(selector: Arc<ModelSelector>) -> Self {
        Self { selector }
    }

    /// Produce a walkthrough. Never fails: generation problems are returned
    /// as degradations next to a skeleton walkthrough.
    pub async fn generate(
        &self,
        repo: &RepositoryRef,
        analysis: &AnalysisSummary,
        files: &[SourceFile],
        level: UserLevel,
    ) -> (Walkthrough, Vec<Degradation>) {
        let mut walkthrough = skeleton(repo, analysis, files, level);
        let mut degradations = Vec::new();

        let mut request = GenerationRequest::new(
            system_prompt(level),
            overview_prompt(repo, analysis, level),
            walkthrough.description.clone(),
        );
        request.max_tokens = 600;

        match self.selector.generate(&request).await {
            Ok(generation) => {
                if generation.is_static() {
                    degradations.push(Degradation::new(
                        DegradationKind::GenerationUnavailable,
                        "no language model answered; walkthrough overview is templated",
                    ));
                } else {
                    if generation.fell_back() {
                        degradations.push(Degradation::new(
                            DegradationKind::ModelUnavailable,
                            format!("walkthrough served by fallback backend {}", generation.backend),
                        ));
                    }
                    walkthrough.description = generation.text.trim().to_string();
                    walkthrough.skeleton = false;
                }
                walkthrough.generated_by = generation.tier;
                walkthrough.backend = generation.backend;
            }
            Err(e) => {
                degradations.push(Degradation::new(
                    DegradationKind::GenerationUnavailable,
                    e.to_string(),
                ));
            }
        }

        (walkthrough, degradations)
    }
}

fn system_prompt(level: UserLevel) -> String {
    let audience = match level {
        UserLevel::Beginner => "a developer new to this kind of codebase; explain concepts simply",
        UserLevel::Intermediate => "a developer with working experience; focus on structure and patterns",
        UserLevel::Advanced => "an experienced engineer; focus on design decisions and trade-offs",
    };
    format!(
        "You write concise onboarding walkthroughs for source repositories. The reader is {audience}. \
         Answer in plain prose, at most three short paragraphs."
    )
}

fn overview_prompt(repo: &RepositoryRef, analysis: &AnalysisSummary, level: UserLevel) -> String {
    let languages: Vec<String> = analysis
        .languages
        .iter()
        .map(|l| format!("{} ({} files)", l.language, l.files))
        .collect();
    let entry_points: Vec<&str> = analysis.entry_points.iter().take(5).map(|e| e.file.as_str()).collect();
    let components: Vec<String> = analysis
        .key_components
        .iter()
        .take(8)
        .map(|c| format!("{} [{}]", c.file, c.kind))
        .collect();

    format!(
        "Repository: {}\nURL: {}\nArchitecture: {}\nLanguages: {}\nFrameworks: {}\n\
         Entry points: {}\nKey components: {}\nComplexity score: {}/100\n\n\
         Write an overview for a {} reader explaining what this repository does and \
         how to start exploring it.",
        repo.id,
        repo.url,
        analysis.architecture_pattern,
        or_none(&languages.join(", ")),
        or_none(&analysis.frameworks.join(", ")),
        or_none(&entry_points.join(", ")),
        or_none(&components.join(", ")),
        analysis.complexity_score,
        level,
    )
}

fn or_none(s: &str) -> &str {
    if s.is_empty() {
        "none detected"
    } else {
        s
    }
}

/// Deterministic walkthrough built only from the analysis and the files.
pub fn skeleton(
    repo: &RepositoryRef,
    analysis: &AnalysisSummary,
    files: &[SourceFile],
    level: UserLevel,
) -> Walkthrough {
    let level_name = match analysis.complexity_score {
        0..=24 => "Beginner",
        25..=59 => "Intermediate",
        _ => "Advanced",
    };

    let mut description = format!(
        "{} is a {} codebase",
        repo.id, analysis.architecture_pattern
    );
    if let Some(lang) = analysis.primary_language() {
        description.push_str(&format!(" written mainly in {lang}"));
    }
    if !analysis.frameworks.is_empty() {
        description.push_str(&format!(" using {}", analysis.frameworks.join(", ")));
    }
    description.push('.');
    if let Some(entry) = analysis.entry_points.first() {
        description.push_str(&format!(" Start reading at {}.", entry.file));
    }

    let index = FileIndex::new(files);
    let modules = analysis
        .learning_path
        .iter()
        .enumerate()
        .map(|(i, step)| LearningModule {
            id: format!("module_{}", i + 1),
            title: step.title.clone(),
            description: step.description.clone(),
            difficulty: step.difficulty.clone(),
            estimated_time: step.estimated_time.clone(),
            objectives: objectives_for(step),
            focus_files: step.focus_files.clone(),
            snippets: quiz::snippets_for(step, &index),
            activities: quiz::activities_for(step, level),
            quiz: quiz::quiz_for(step, analysis, &index),
            unlocked: i == 0,
        })
        .collect();

    Walkthrough {
        title: format!("Code Quest: {}", repo.id),
        description,
        difficulty: Difficulty {
            level: level_name.to_string(),
            complexity_score: analysis.complexity_score,
            user_level: level,
        },
        estimated_time: estimate_time(analysis),
        modules,
        generated_by: Tier::Static,
        backend: "static".to_string(),
        skeleton: true,
    }
}

fn estimate_time(analysis: &AnalysisSummary) -> String {
    let minutes = 30 + analysis.complexity_score as usize * 2 + analysis.key_components.len() * 5;
    if minutes < 60 {
        format!("{minutes} minutes")
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

fn objectives_for(step: &LearningStep) -> Vec<String> {
    let title = step.title.to_ascii_lowercase();
    let objectives: [&str; 3] = if title.contains("overview") {
        [
            "Understand the overall project structure",
            "Identify key technologies and frameworks used",
            "Recognize the architectural pattern",
        ]
    } else if title.contains("entry") {
        [
            "Locate application entry points",
            "Understand the initialization flow",
            "Identify the main execution paths",
        ]
    } else if title.contains("component") {
        [
            "Analyze the core business logic",
            "Understand how components relate",
            "Identify data flow patterns",
        ]
    } else if title.contains("dependencies") {
        [
            "Map external dependencies",
            "Understand integration points",
            "Identify upgrade risks",
        ]
    } else {
        [
            "Study the advanced concepts in use",
            "Recognize the design patterns applied",
            "Evaluate the architectural decisions",
        ]
    };
    objectives.iter().map(|s| s.to_string()).collect()
}
