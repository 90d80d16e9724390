//! State a capability may touch while it runs.

use crate::protocol::Artifact;
use crate::scope::ExecutionScope;

/// Default cap on captured output (1 MiB).
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Append-only text buffer that stops growing at a byte limit.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    /// Creates an empty buffer holding at most `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Appends `chunk`, cutting it at a character boundary once the limit is
    /// reached.
    pub fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }
        let mut cut = room;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.truncated = true;
    }

    /// Captured text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True once anything was dropped.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Consumes the buffer.
    #[must_use]
    pub fn into_parts(self) -> (String, bool) {
        (self.text, self.truncated)
    }
}

/// Mutable view handed to every capability call.
#[derive(Debug)]
pub struct CallContext<'a> {
    scope: &'a ExecutionScope,
    output: &'a mut OutputBuffer,
    artifacts: &'a mut Vec<Artifact>,
    want_artifacts: bool,
}

impl<'a> CallContext<'a> {
    /// Creates a context over the interpreter's state.
    pub fn new(
        scope: &'a ExecutionScope,
        output: &'a mut OutputBuffer,
        artifacts: &'a mut Vec<Artifact>,
        want_artifacts: bool,
    ) -> Self {
        Self {
            scope,
            output,
            artifacts,
            want_artifacts,
        }
    }

    /// Scope the script runs in.
    #[must_use]
    pub fn scope(&self) -> &'a ExecutionScope {
        self.scope
    }

    /// Writes one line of printed output.
    pub fn print(&mut self, line: &str) {
        self.output.push(line);
        self.output.push("\n");
    }

    /// Records an artifact. Dropped when the caller did not ask for
    /// artifacts.
    pub fn emit_artifact(&mut self, media_type: impl Into<String>, data: Vec<u8>) -> bool {
        if !self.want_artifacts {
            return false;
        }
        self.artifacts.push(Artifact {
            media_type: media_type.into(),
            data,
        });
        true
    }
}
