//! Prompt assembly
//!
//! System prompt: the report template with the model name filled in.
//! User content: reference data table, source statistics, numbered article
//! excerpts and, on retries, feedback from the previous attempt.

use crate::config::PromptConfig;
use crate::models::{Article, ReferenceSnapshot};
use std::collections::BTreeMap;
use std::fmt::Write;

pub const MODEL_PLACEHOLDER: &str = "{{MODEL}}";
const LEGACY_MODEL_PLACEHOLDER: &str = "[使用的具体模型名称]";

pub const DEFAULT_REPORT_TEMPLATE: &str = r#"你是一名资深金融分析师，使用模型 {{MODEL}} 撰写每日市场分析报告。

报告必须包含以下章节（使用 Markdown 二级标题）：
## 市场概况
## 投资主题
## 风险提示
## 投资建议

写作规则：
- 所有价格与涨跌幅只能引用“实时参考数据”表格中的数值，并注明数据时间。
- 表格中没有的标的，不得给出任何具体价格或涨跌幅。
- 不得给出目标价、目标涨幅或任何未经数据支持的预测数值。
- 每个章节至少引用一条新闻，引用格式为【新闻N】，N 为摘录编号。
- 不得留下 N/A、待定 等占位内容。
- 报告末尾注明：本报告由 {{MODEL}} 生成，仅供参考，不构成投资建议。
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub struct PromptBuilder {
    config: PromptConfig,
}

impl PromptBuilder {
    pub fn new(config: PromptConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PromptConfig {
        &self.config
    }

    pub fn render_system(&self, template: &str, model: &str) -> String {
        template
            .replace(MODEL_PLACEHOLDER, model)
            .replace(LEGACY_MODEL_PLACEHOLDER, model)
    }

    pub fn render_user(
        &self,
        snapshot: &ReferenceSnapshot,
        articles: &[Article],
        feedback: Option<&str>,
    ) -> String {
        let excerpts = self.excerpts(articles);
        let mut out = String::new();

        out.push_str(&render_reference_block(snapshot));
        out.push('\n');
        out.push_str(&render_source_stats(&articles[..excerpts.len()]));
        out.push('\n');

        out.push_str("## 新闻摘录\n\n");
        for excerpt in &excerpts {
            out.push_str(excerpt);
            out.push('\n');
        }

        if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
            out.push_str("\n## 上一版本的问题\n");
            out.push_str("请修正以下问题，并重新输出完整报告：\n");
            out.push_str(feedback);
            out.push('\n');
        }

        out
    }

    /// Number of articles that fit in the prompt.
    pub fn included_articles(&self, articles: &[Article]) -> usize {
        self.excerpts(articles).len()
    }

    /// Numbered excerpts, capped by count, per-article length and total size.
    /// Articles past the total budget are dropped, never cut mid-way.
    fn excerpts(&self, articles: &[Article]) -> Vec<String> {
        let mut excerpts = Vec::new();
        let mut total_chars = 0usize;

        for (idx, article) in articles.iter().take(self.config.max_articles).enumerate() {
            let body = truncate_chars(article.excerpt_text().trim(), self.config.max_chars_per_article);

            let mut block = format!(
                "【新闻{}】{}\n来源: {} | 时间: {}\n",
                idx + 1,
                article.title,
                article.source,
                article.published_at.format("%Y-%m-%d %H:%M UTC")
            );
            if let Some(link) = &article.link {
                let _ = writeln!(block, "链接: {}", link);
            }
            block.push_str(&body);
            block.push('\n');

            let len = block.chars().count();
            if total_chars + len > self.config.max_total_chars {
                break;
            }
            total_chars += len;
            excerpts.push(block);
        }

        excerpts
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(PromptConfig::default())
    }
}

pub fn render_reference_block(snapshot: &ReferenceSnapshot) -> String {
    let mut out = String::from("## 实时参考数据\n");
    let _ = writeln!(
        out,
        "数据时间: {}",
        snapshot.taken_at.format("%Y-%m-%d %H:%M UTC")
    );

    if snapshot.is_empty() {
        out.push_str("本次没有可用的实时参考数据。不得给出任何具体价格或涨跌幅。\n");
        return out;
    }

    out.push_str("以下为唯一可信的行情数据。未列出的标的没有数据，不得编造数值。\n\n");
    out.push_str("| 代码 | 名称 | 价格 | 涨跌幅 | 数据时间 |\n");
    out.push_str("|---|---|---|---|---|\n");
    for entry in snapshot.entries() {
        let quote = entry.quote;
        let _ = writeln!(
            out,
            "| {} | {} | {:.2} {} | {} | {} |",
            entry.key,
            quote.name.as_deref().unwrap_or("-"),
            quote.price,
            quote.currency,
            quote
                .change_percent
                .map(|c| format!("{:+.2}%", c))
                .unwrap_or_else(|| "-".to_string()),
            quote.as_of.format("%Y-%m-%d %H:%M UTC"),
        );
    }
    out
}

fn render_source_stats(articles: &[Article]) -> String {
    let mut by_source: BTreeMap<&str, usize> = BTreeMap::new();
    for article in articles {
        *by_source.entry(article.source.as_str()).or_default() += 1;
    }

    let mut out = String::from("## 资料统计\n");
    let first = articles.iter().map(|a| a.published_at).min();
    let last = articles.iter().map(|a| a.published_at).max();
    let _ = write!(out, "文章数: {}", articles.len());
    if let (Some(first), Some(last)) = (first, last) {
        let _ = write!(
            out,
            " | 时间范围: {} 至 {}",
            first.format("%Y-%m-%d"),
            last.format("%Y-%m-%d")
        );
    }
    out.push('\n');

    let mut ranked: Vec<(&str, usize)> = by_source.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    for (source, count) in ranked {
        let _ = writeln!(out, "- {}: {}", source, count);
    }
    out
}

/// First `max_chars` characters, with an ellipsis when cut.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
