// ============================================
// prompt.rs - Yes/no questions for the operator
// ============================================
//
// Only two questions are ever asked:
//   "Retry with administrator rights? (Y/n)"   - default yes
//   "Delete the Veyon data folder? [y/N]"      - default no
// Anything that isn't clearly yes or no means "use the default".
// ============================================

use std::io::{self, BufRead, Write};

pub trait Prompt {
    fn confirm(&mut self, question: &str, default: bool) -> bool;
}

/// Asks on stdin/stdout.
pub struct ConsolePrompt;

impl Prompt for ConsolePrompt {
    fn confirm(&mut self, question: &str, default: bool) -> bool {
        let hint = if default { "(Y/n)" } else { "[y/N]" };
        print!("{} {}: ", question, hint);
        let _ = io::stdout().flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(_) => parse_answer(&line, default),
            // Closed stdin (scheduled task, piped input) -> default
            Err(_) => default,
        }
    }
}

pub fn parse_answer(input: &str, default: bool) -> bool {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => true,
        "n" | "no" => false,
        _ => default,
    }
}
