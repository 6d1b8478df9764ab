use console::style;

use crate::core::log::{LogLevel, LogSnapshot};

const CONTENT_INDENT: &str = "      ";

/// Renders a store snapshot as an outline: one summary row per step, step bodies only when
/// `expanded`, and the final result last.
pub(crate) fn render_outline(snapshot: &LogSnapshot, expanded: bool) -> Vec<String> {
    let mut lines = Vec::new();

    if let Some(excerpt) = &snapshot.system_prompt_excerpt {
        lines.push(format!("{} {}", style("system prompt:").dim(), excerpt));
    }

    if snapshot.steps.is_empty() {
        lines.push(format!("{}", style("(no steps)").dim()));
    }

    for step in &snapshot.steps {
        let marker = if expanded { "▾" } else { "▸" };
        let summary = if step.level == Some(LogLevel::Error) {
            format!("{}", style(&step.summary).red())
        } else {
            step.summary.clone()
        };
        lines.push(format!(" {} {}", marker, summary));
        if expanded {
            for line in step.content.lines() {
                lines.push(format!("{}{}", CONTENT_INDENT, line));
            }
            if let Some(error) = &step.error {
                lines.push(format!("{}{} {}", CONTENT_INDENT, style("error:").red(), error));
            }
        }
    }

    if let Some(result) = &snapshot.final_result {
        lines.push(String::new());
        lines.push(format!("{}", style("Final result").bold().underlined()));
        lines.extend(result.content.lines().map(str::to_string));
    }

    lines
}

pub(crate) fn print_outline(snapshot: &LogSnapshot, expanded: bool) {
    println!();
    for line in render_outline(snapshot, expanded) {
        println!("{}", line);
    }
}
