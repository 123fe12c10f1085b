use std::fmt::{self, Display, Write as _};

const INDENT: &str = "  ";

/// Indented text log used by the `dump_state_log` family.
#[derive(Debug, Default, Clone)]
pub struct HierarchicalLog {
    out: String,
    depth: usize,
}

impl HierarchicalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, text: impl Display) {
        for _ in 0..self.depth {
            self.out.push_str(INDENT);
        }
        // Writing into a String cannot fail.
        let _ = writeln!(self.out, "{text}");
    }

    pub fn push_scope(&mut self, title: impl Display) {
        self.line(title);
        self.depth += 1;
    }

    pub fn pop_scope(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Write `title` and indent everything logged inside `body` under it.
    pub fn scope(&mut self, title: impl Display, body: impl FnOnce(&mut Self)) {
        self.push_scope(title);
        body(self);
        self.pop_scope();
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn into_string(self) -> String {
        self.out
    }
}

impl Display for HierarchicalLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.out)
    }
}
