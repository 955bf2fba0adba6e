//! Console rendering for operators watching a run.
//!
//! Durable records go to the event sink; this is the human-facing echo.

use colored::Colorize;

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Console echo that can be silenced (tests, `--quiet`).
#[derive(Debug, Clone, Copy)]
pub struct Console {
    enabled: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Console {
    pub fn quiet() -> Self {
        Self { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn banner(&self, text: &str) {
        if self.enabled {
            println!("\n{}\n", text.bright_white().bold());
        }
    }

    pub fn step(&self, index: usize, description: &str) {
        if self.enabled {
            println!("\n{} {}", format!("[STEP {}]", index).bright_cyan(), description);
        }
    }

    pub fn line(&self, text: &str) {
        if self.enabled {
            println!("{}", text);
        }
    }

    /// Colour an `[EVAL]...` tag by outcome and print it with `message`.
    pub fn eval(&self, tag: &str, message: &str) {
        if !self.enabled {
            return;
        }
        let rendered = if tag.contains("PASSED") {
            tag.bright_green().bold()
        } else if tag.contains("FAILED") {
            tag.bright_red().bold()
        } else {
            tag.bright_yellow()
        };
        if message.is_empty() {
            println!("{}", rendered);
        } else {
            println!("{} {}", rendered, message);
        }
    }

    pub fn warn(&self, message: &str) {
        if self.enabled {
            println!("{} {}", "[WARNING]".bright_yellow().bold(), message);
        }
    }

    pub fn info(&self, message: &str) {
        if self.enabled {
            println!("{} {}", "[INFO]".bright_blue(), message);
        }
    }
}
