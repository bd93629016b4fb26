//! Moves oversized tool results into the virtual filesystem.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::ToolOutput;
use crate::backend::Backend;
use crate::types::CallContext;
use crate::util::content::CHARS_PER_TOKEN;
use crate::util::format_with_line_numbers;

/// Directory evicted results are written under.
pub const LARGE_RESULTS_DIR: &str = "/large_tool_results";

/// Lines of the evicted payload shown in the pointer message.
const PREVIEW_LINES: usize = 10;

pub const TOO_LARGE_TOOL_MSG: &str = "Tool result too large, the result of this tool call {tool_call_id} was saved in the filesystem at this path: {file_path}
You can read the result from the filesystem by using the read_file tool, but make sure to only read part of the result at a time.
You can do this by specifying an offset and limit in the read_file tool call.
For example, to read the first 100 lines, you can use the read_file tool with offset=0 and limit=100.

Here are the first 10 lines of the result:
{content_sample}";

/// Replaces results over the budget with a pointer to a file holding them.
pub struct EvictionGuard {
    backend: Arc<dyn Backend>,
    token_limit: usize,
}

impl EvictionGuard {
    pub fn new(backend: Arc<dyn Backend>, token_limit: usize) -> Self {
        Self {
            backend,
            token_limit,
        }
    }

    pub fn char_limit(&self) -> usize {
        self.token_limit.saturating_mul(CHARS_PER_TOKEN)
    }

    pub async fn apply(&self, ctx: &CallContext<'_>, mut output: ToolOutput) -> ToolOutput {
        if output.content.chars().count() <= self.char_limit() {
            return output;
        }

        let call_id = ctx
            .tool_call_id
            .map(sanitize_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let file_path = format!("{LARGE_RESULTS_DIR}/{call_id}");

        let written = match self.backend.write(ctx, &file_path, &output.content).await {
            Ok(res) => match res.error {
                None => res.files_update,
                Some(error) => {
                    warn!("Could not evict tool result to {}: {}", file_path, error);
                    return output;
                }
            },
            Err(e) => {
                warn!("Could not evict tool result to {}: {}", file_path, e);
                return output;
            }
        };

        info!(
            "Evicted {} chars of tool output to {}",
            output.content.len(),
            file_path
        );
        let message = TOO_LARGE_TOOL_MSG
            .replace("{tool_call_id}", &call_id)
            .replace("{file_path}", &file_path)
            .replace("{content_sample}", &content_sample(&output.content));
        output.content = message;
        output.merge_update(written);
        output
    }
}

/// Keep ids usable as a single path segment.
fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        cleaned
    }
}

fn content_sample(content: &str) -> String {
    let lines: Vec<&str> = content.lines().take(PREVIEW_LINES).collect();
    format_with_line_numbers(&lines, 1)
}
