//! Built-in handlers for the four task kinds.
//!
//! Each handler walks its input list one item at a time, pausing for a
//! configurable step delay that stands in for a call to an external content
//! service, and produces template-based output.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::handler::{HandlerRegistry, ProgressReporter, TaskError, TaskHandler};
use super::task::TaskKind;

const DEFAULT_TITLE_COUNT: usize = 3;
const MAX_TITLE_COUNT: usize = 10;

const TITLE_TEMPLATES: [&str; 5] = [
    "The Complete Guide to {}",
    "{}: Everything You Need to Know",
    "How to Get Started with {}",
    "Common {} Mistakes and How to Avoid Them",
    "Why {} Matters More Than Ever",
];

impl HandlerRegistry {
    /// A registry with the built-in handler for every kind.
    pub fn with_builtin(step_delay: Duration) -> Self {
        HandlerRegistry::new()
            .with(
                TaskKind::KeywordAnalysis,
                Arc::new(KeywordAnalysisHandler::new(step_delay)),
            )
            .with(
                TaskKind::TitleGeneration,
                Arc::new(TitleGenerationHandler::new(step_delay)),
            )
            .with(
                TaskKind::ContentGeneration,
                Arc::new(ContentGenerationHandler::new(step_delay)),
            )
            .with(
                TaskKind::CompositeWorkflow,
                Arc::new(CompositeWorkflowHandler::new(step_delay)),
            )
    }
}

/// Analyzes each keyword in `parameters.keywords`.
#[derive(Debug, Clone)]
pub struct KeywordAnalysisHandler {
    step_delay: Duration,
}

impl KeywordAnalysisHandler {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

#[async_trait]
impl TaskHandler for KeywordAnalysisHandler {
    async fn execute(
        &self,
        parameters: &Value,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let keywords = string_list(parameters, "keywords")?;
        let mut analyses = Vec::with_capacity(keywords.len());

        for (done, keyword) in keywords.iter().enumerate() {
            step(self.step_delay, cancel).await?;
            analyses.push(analyze_keyword(keyword));
            progress.report_fraction(done + 1, keywords.len());
        }

        Ok(json!({ "analyses": analyses }))
    }
}

/// Generates `parameters.count` titles for each of `parameters.keywords`.
#[derive(Debug, Clone)]
pub struct TitleGenerationHandler {
    step_delay: Duration,
}

impl TitleGenerationHandler {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

#[async_trait]
impl TaskHandler for TitleGenerationHandler {
    async fn execute(
        &self,
        parameters: &Value,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let keywords = string_list(parameters, "keywords")?;
        let count = title_count(parameters)?;
        let mut results = Vec::with_capacity(keywords.len());

        for (done, keyword) in keywords.iter().enumerate() {
            step(self.step_delay, cancel).await?;
            results.push(json!({
                "keyword": keyword,
                "titles": titles_for(keyword, count),
            }));
            progress.report_fraction(done + 1, keywords.len());
        }

        Ok(json!({ "results": results }))
    }
}

/// Builds an article outline for each of `parameters.titles`.
#[derive(Debug, Clone)]
pub struct ContentGenerationHandler {
    step_delay: Duration,
}

impl ContentGenerationHandler {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

#[async_trait]
impl TaskHandler for ContentGenerationHandler {
    async fn execute(
        &self,
        parameters: &Value,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let titles = string_list(parameters, "titles")?;
        let mut articles = Vec::with_capacity(titles.len());

        for (done, title) in titles.iter().enumerate() {
            step(self.step_delay, cancel).await?;
            articles.push(outline_for(title));
            progress.report_fraction(done + 1, titles.len());
        }

        Ok(json!({ "articles": articles }))
    }
}

/// Runs keyword analysis, title generation and content generation in turn
/// for each of `parameters.keywords`.
#[derive(Debug, Clone)]
pub struct CompositeWorkflowHandler {
    step_delay: Duration,
}

impl CompositeWorkflowHandler {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

#[async_trait]
impl TaskHandler for CompositeWorkflowHandler {
    async fn execute(
        &self,
        parameters: &Value,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let keywords = string_list(parameters, "keywords")?;
        let total = keywords.len() * 3;
        let mut done = 0;

        let mut analyses = Vec::with_capacity(keywords.len());
        for keyword in &keywords {
            step(self.step_delay, cancel).await?;
            analyses.push(analyze_keyword(keyword));
            done += 1;
            progress.report_fraction(done, total);
        }
        trace!(keywords = keywords.len(), "Keyword stage finished");

        let mut titles = Vec::with_capacity(keywords.len());
        for keyword in &keywords {
            step(self.step_delay, cancel).await?;
            titles.extend(titles_for(keyword, 1));
            done += 1;
            progress.report_fraction(done, total);
        }
        trace!(titles = titles.len(), "Title stage finished");

        let mut articles = Vec::with_capacity(titles.len());
        for title in &titles {
            step(self.step_delay, cancel).await?;
            articles.push(outline_for(title));
            done += 1;
            progress.report_fraction(done, total);
        }

        Ok(json!({
            "analyses": analyses,
            "titles": titles,
            "articles": articles,
        }))
    }
}

/// Wait out one simulated external call, bailing out if cancelled.
async fn step(delay: Duration, cancel: &CancellationToken) -> Result<(), TaskError> {
    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(TaskError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn string_list(parameters: &Value, field: &str) -> Result<Vec<String>, TaskError> {
    let items = parameters
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| TaskError::InvalidParameters(format!("`{}` must be a list of strings", field)))?;

    let list = items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    TaskError::InvalidParameters(format!(
                        "`{}` must only contain non-empty strings",
                        field
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if list.is_empty() {
        return Err(TaskError::InvalidParameters(format!("`{}` must not be empty", field)));
    }
    Ok(list)
}

fn title_count(parameters: &Value) -> Result<usize, TaskError> {
    match parameters.get("count") {
        None | Some(Value::Null) => Ok(DEFAULT_TITLE_COUNT),
        Some(value) => match value.as_u64() {
            Some(n) if (1..=MAX_TITLE_COUNT as u64).contains(&n) => Ok(n as usize),
            _ => Err(TaskError::InvalidParameters(format!(
                "`count` must be between 1 and {}",
                MAX_TITLE_COUNT
            ))),
        },
    }
}

fn analyze_keyword(keyword: &str) -> Value {
    json!({
        "keyword": keyword,
        "word_count": keyword.split_whitespace().count(),
        "char_count": keyword.chars().count(),
        "long_tail": [
            format!("how to {}", keyword),
            format!("best {} tips", keyword),
            format!("{} for beginners", keyword),
        ],
    })
}

fn titles_for(keyword: &str, count: usize) -> Vec<String> {
    TITLE_TEMPLATES
        .iter()
        .cycle()
        .take(count)
        .enumerate()
        .map(|(i, template)| {
            let title = template.replacen("{}", keyword, 1);
            // Templates repeat once the count passes their number
            match i / TITLE_TEMPLATES.len() {
                0 => title,
                round => format!("{} (Part {})", title, round + 1),
            }
        })
        .collect()
}

fn outline_for(title: &str) -> Value {
    json!({
        "title": title,
        "sections": [
            "Introduction",
            format!("Understanding {}", title),
            "Key Considerations",
            "Practical Steps",
            "Conclusion",
        ],
    })
}
