//! Per-module exercises: quiz questions, code snippets and activities.
//!
//! Everything here is derived from the module's focus files and the
//! analysis alone, so the same repository always yields the same quiz.
//! Declarations are found with [`extract_symbols`]; distractors come from
//! the other files of the repository before falling back to stock names.

use serde::Serialize;
use std::collections::HashMap;

use codequest_core::chunk::extract_symbols;
use codequest_core::models::SourceFile;

use crate::analyze::{AnalysisSummary, LearningStep};
use crate::walkthrough::UserLevel;

/// Questions per module.
pub const QUIZ_LEN: usize = 3;
/// Lines shown per snippet.
pub const SNIPPET_LINES: usize = 10;

const QUIZ_FILES: usize = 2;
const SNIPPET_FILES: usize = 3;
const STOCK_NAMES: &[&str] = &["handle_request", "parse_config", "Registry", "run_migrations"];
const ARCHITECTURES: &[&str] = &[
    "Monolithic",
    "MVC Architecture",
    "Component-Based Architecture",
    "Flask Microservice",
];

/// A multiple-choice check on the module's material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    /// Index into `options`.
    pub answer_index: usize,
    pub explanation: String,
}

/// A short excerpt starting at a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeSnippet {
    pub file_path: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub kind: String,
    pub title: String,
    pub instructions: Vec<String>,
}

/// Files of one repository by path, with their declared names.
pub struct FileIndex<'a> {
    files: HashMap<&'a str, &'a SourceFile>,
    symbols: HashMap<&'a str, Vec<String>>,
}

impl<'a> FileIndex<'a> {
    pub fn new(files: &'a [SourceFile]) -> Self {
        let files: HashMap<&str, &SourceFile> = files.iter().map(|f| (f.path.as_str(), f)).collect();
        let symbols = files
            .iter()
            .map(|(path, f)| (*path, extract_symbols(&f.content)))
            .collect();
        Self { files, symbols }
    }

    fn symbols(&self, path: &str) -> Option<&[String]> {
        self.symbols.get(path).map(Vec::as_slice)
    }

    /// Names declared anywhere except `path`, sorted for stable output.
    fn declared_elsewhere(&self, path: &str) -> Vec<String> {
        let own = self.symbols(path).unwrap_or(&[]);
        let mut names: Vec<String> = self
            .symbols
            .iter()
            .filter(|(p, _)| **p != path)
            .flat_map(|(_, s)| s.iter())
            .filter(|s| !own.contains(s))
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Up to [`QUIZ_LEN`] questions for one learning step.
pub fn quiz_for(step: &LearningStep, analysis: &AnalysisSummary, index: &FileIndex) -> Vec<QuizQuestion> {
    let mut questions = Vec::new();
    for path in step.focus_files.iter().take(QUIZ_FILES) {
        let Some(symbols) = index.symbols(path).filter(|s| !s.is_empty()) else {
            continue;
        };
        questions.push(declared_in(path, symbols, index));
        questions.push(declaration_count(path, symbols.len()));
    }
    if questions.len() < 2 && !step.focus_files.is_empty() {
        questions.push(file_count(step));
    }
    if questions.len() < QUIZ_LEN {
        questions.push(architecture(analysis));
    }
    questions.truncate(QUIZ_LEN);
    questions
}

fn declared_in(path: &str, symbols: &[String], index: &FileIndex) -> QuizQuestion {
    let answer = symbols[0].clone();
    let mut distractors = index.declared_elsewhere(path);
    for stock in STOCK_NAMES {
        if distractors.len() >= 3 {
            break;
        }
        let stock = stock.to_string();
        if !symbols.contains(&stock) && !distractors.contains(&stock) {
            distractors.push(stock);
        }
    }
    distractors.truncate(3);
    let (options, answer_index) = place(answer.clone(), distractors, seed(path));
    QuizQuestion {
        question: format!("Which of these names is declared in `{path}`?"),
        options,
        answer_index,
        explanation: format!("`{answer}` is declared in {path}."),
    }
}

fn declaration_count(path: &str, n: usize) -> QuizQuestion {
    let (options, answer_index) = counts(n, seed(path));
    QuizQuestion {
        question: format!("How many named declarations (functions, types, modules) does `{path}` contain?"),
        options,
        answer_index,
        explanation: format!("{path} declares {n} distinct name(s)."),
    }
}

fn file_count(step: &LearningStep) -> QuizQuestion {
    let n = step.focus_files.len();
    let (options, answer_index) = counts(n, seed(&step.title));
    QuizQuestion {
        question: format!("How many key files does the '{}' module ask you to explore?", step.title),
        options,
        answer_index,
        explanation: format!("The module focuses on {}.", step.focus_files.join(", ")),
    }
}

fn architecture(analysis: &AnalysisSummary) -> QuizQuestion {
    let answer = analysis.architecture_pattern.clone();
    let distractors: Vec<String> = ARCHITECTURES
        .iter()
        .filter(|a| **a != answer)
        .take(3)
        .map(|a| a.to_string())
        .collect();
    let (options, answer_index) = place(answer.clone(), distractors, seed(&answer));
    QuizQuestion {
        question: "Which architectural pattern best describes this repository?".to_string(),
        options,
        answer_index,
        explanation: format!("The static analysis classified the layout as {answer}."),
    }
}

/// Four consecutive counts containing `n`, shifted by `seed`.
fn counts(n: usize, seed: usize) -> (Vec<String>, usize) {
    let base = n.saturating_sub(seed % 4);
    let options = (base..base + 4).map(|c| c.to_string()).collect();
    (options, n - base)
}

/// Insert `answer` among `distractors` at a position chosen by `seed`.
fn place(answer: String, mut distractors: Vec<String>, seed: usize) -> (Vec<String>, usize) {
    let at = seed % (distractors.len() + 1);
    distractors.insert(at, answer);
    (distractors, at)
}

fn seed(s: &str) -> usize {
    s.bytes().map(usize::from).sum()
}

/// One excerpt per focus file, starting at its first declaration.
pub fn snippets_for(step: &LearningStep, index: &FileIndex) -> Vec<CodeSnippet> {
    step.focus_files
        .iter()
        .filter_map(|path| index.files.get(path.as_str()))
        .filter_map(|file| snippet(file))
        .take(SNIPPET_FILES)
        .collect()
}

fn snippet(file: &SourceFile) -> Option<CodeSnippet> {
    let lines: Vec<&str> = file.content.lines().collect();
    let start = lines.iter().position(|l| !extract_symbols(l).is_empty())?;
    let end = (start + SNIPPET_LINES).min(lines.len());
    Some(CodeSnippet {
        file_path: file.path.clone(),
        start_line: start + 1,
        end_line: end,
        code: lines[start..end].join("\n"),
    })
}

pub fn activities_for(step: &LearningStep, level: UserLevel) -> Vec<Activity> {
    let mut activities = Vec::new();
    if !step.focus_files.is_empty() {
        activities.push(activity(
            "file_exploration",
            format!("Explore the {} key file(s) of this module", step.focus_files.len()),
            &[
                "Open each focus file",
                "Write down the main purpose of each file",
                "Note how the files refer to each other",
            ],
        ));
    }
    activities.push(activity(
        "pattern_recognition",
        "Find the recurring patterns".to_string(),
        &[
            "Look for repeated code structures",
            "Identify naming conventions",
            "Note how errors are handled",
        ],
    ));
    if level != UserLevel::Beginner {
        activities.push(activity(
            "code_tracing",
            "Trace one request through the code".to_string(),
            &[
                "Start from an entry point",
                "Follow the execution path",
                "Record each place data changes shape",
            ],
        ));
    }
    activities
}

fn activity(kind: &str, title: String, instructions: &[&str]) -> Activity {
    Activity {
        kind: kind.to_string(),
        title,
        instructions: instructions.iter().map(|s| s.to_string()).collect(),
    }
}
