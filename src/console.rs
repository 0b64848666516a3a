// Jetporch
// Copyright (C) 2023 - Michael DeHaan <michael@michaeldehaan.net> + contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// long with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The console is the framework's only input oracle: Retry/Skip/Abort
//! prompts, the "choose one isolation" prompt, and the sudo-password prompt
//! on LocalHost all go through this trait.

use std::io::{self, Write, BufRead};
use std::sync::{Arc, Mutex};

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySkipAbort {
    Retry,
    Skip,
    Abort,
}

pub trait Console: Send + Sync {
    fn input(&self, prompt: &str, is_password: bool, default: Option<&str>) -> String;
    fn confirm(&self, question: &str, default: bool) -> bool;

    /// Prompt the operator to pick one of `options`. When the answer can't
    /// be resolved to an in-range choice and `allow_random` is set, picks
    /// uniformly at random instead of falling back to `default` — used by
    /// the "isolate one host" prompt so operators get a fair sample rather
    /// than always landing on the same host (§6).
    fn choice(&self, prompt: &str, options: &[String], default: usize, allow_random: bool) -> usize;
    fn warning(&self, text: &str);
    fn progress_bar_with_steps(&self, label: &str, steps: usize) -> ProgressHandle;

    /// Retry/Skip/Abort prompt used by the per-isolation error handler.
    /// Default is Abort when input can't be parsed.
    fn retry_skip_abort(&self, prompt: &str) -> RetrySkipAbort {
        let answer = self.input(&format!("{} [r]etry/[s]kip/[A]bort", prompt), false, Some("a"));
        match answer.trim().to_lowercase().as_str() {
            "r" | "retry" => RetrySkipAbort::Retry,
            "s" | "skip" => RetrySkipAbort::Skip,
            _ => RetrySkipAbort::Abort,
        }
    }
}

pub type ConsoleRef = Arc<dyn Console>;

/// A scoped progress indicator; advancing past `steps` is harmless.
pub struct ProgressHandle {
    label: String,
    steps: usize,
    current: usize,
    silent: bool,
}

impl ProgressHandle {
    pub fn advance(&mut self) {
        self.current = (self.current + 1).min(self.steps);
        if !self.silent {
            println!("{}: {}/{}", self.label, self.current, self.steps);
        }
    }
}

/// Reads stdin / writes stdout directly. No fancy TUI, matching the rest of
/// this corpus's terminal posture.
pub struct StdConsole;

impl Console for StdConsole {
    fn input(&self, prompt: &str, is_password: bool, default: Option<&str>) -> String {
        if is_password {
            print!("{}: ", prompt);
        } else if let Some(d) = default {
            print!("{} [{}]: ", prompt, d);
        } else {
            print!("{}: ", prompt);
        }
        let _ = io::stdout().flush();

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return default.unwrap_or("").to_string();
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            default.unwrap_or("").to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn confirm(&self, question: &str, default: bool) -> bool {
        let hint = if default { "Y/n" } else { "y/N" };
        let answer = self.input(&format!("{} [{}]", question, hint), false, None);
        if answer.is_empty() {
            return default;
        }
        matches!(answer.to_lowercase().as_str(), "y" | "yes")
    }

    fn choice(&self, prompt: &str, options: &[String], default: usize, allow_random: bool) -> usize {
        for (i, opt) in options.iter().enumerate() {
            println!("  {}) {}", i + 1, opt);
        }
        let answer = self.input(prompt, false, None);
        match answer.parse::<usize>() {
            Ok(n) if n >= 1 && n <= options.len() => n - 1,
            _ if allow_random && !options.is_empty() => rand::rng().random_range(0..options.len()),
            _ => default,
        }
    }

    fn warning(&self, text: &str) {
        termimad::print_text(&format!("|:-|\n|**WARNING**: {}|\n|-", text));
    }

    fn progress_bar_with_steps(&self, label: &str, steps: usize) -> ProgressHandle {
        ProgressHandle { label: label.to_string(), steps, current: 0, silent: false }
    }
}

/// Replays a fixed queue of canned answers. Used to exercise
/// confirm/choice/retry-skip-abort round trips without a live terminal.
pub struct ScriptedConsole {
    answers: Mutex<Vec<String>>,
}

impl ScriptedConsole {
    pub fn new(answers: Vec<&str>) -> Self {
        Self { answers: Mutex::new(answers.into_iter().map(|s| s.to_string()).rev().collect()) }
    }

    fn next_answer(&self) -> Option<String> {
        self.answers.lock().unwrap().pop()
    }
}

impl Console for ScriptedConsole {
    fn input(&self, _prompt: &str, _is_password: bool, default: Option<&str>) -> String {
        self.next_answer().unwrap_or_else(|| default.unwrap_or("").to_string())
    }

    fn confirm(&self, _question: &str, default: bool) -> bool {
        match self.next_answer() {
            Some(answer) if answer.is_empty() => default,
            Some(answer) => matches!(answer.to_lowercase().as_str(), "y" | "yes"),
            None => default,
        }
    }

    fn choice(&self, _prompt: &str, options: &[String], default: usize, allow_random: bool) -> usize {
        let answer = self.next_answer();
        let exhausted = answer.is_none();
        match answer.and_then(|a| a.parse::<usize>().ok()) {
            Some(n) if n >= 1 && n <= options.len() => n - 1,
            _ if allow_random && exhausted && !options.is_empty() => rand::rng().random_range(0..options.len()),
            _ => default,
        }
    }

    fn warning(&self, _text: &str) {}

    fn progress_bar_with_steps(&self, label: &str, steps: usize) -> ProgressHandle {
        ProgressHandle { label: label.to_string(), steps, current: 0, silent: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_empty_input_uses_default_true() {
        let console = ScriptedConsole::new(vec![""]);
        assert!(console.confirm("proceed?", true));
    }

    #[test]
    fn test_confirm_explicit_no() {
        let console = ScriptedConsole::new(vec!["n"]);
        assert!(!console.confirm("proceed?", true));
    }

    #[test]
    fn test_choice_out_of_range_falls_back_to_default() {
        let console = ScriptedConsole::new(vec!["99"]);
        let options = vec!["a".to_string(), "b".to_string()];
        assert_eq!(console.choice("pick", &options, 1, false), 1);
    }

    #[test]
    fn test_choice_scripted_answer_wins_even_with_allow_random() {
        let console = ScriptedConsole::new(vec!["2"]);
        let options = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(console.choice("pick", &options, 0, true), 1);
    }

    #[test]
    fn test_choice_allow_random_picks_in_range_when_queue_exhausted() {
        let console = ScriptedConsole::new(vec![]);
        let options = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let picked = console.choice("pick", &options, 0, true);
        assert!(picked < options.len());
    }

    #[test]
    fn test_choice_without_allow_random_falls_back_to_default_when_exhausted() {
        let console = ScriptedConsole::new(vec![]);
        let options = vec!["a".to_string(), "b".to_string()];
        assert_eq!(console.choice("pick", &options, 1, false), 1);
    }

    #[test]
    fn test_retry_skip_abort_default_is_abort() {
        let console = ScriptedConsole::new(vec!["bogus"]);
        assert_eq!(console.retry_skip_abort("command failed"), RetrySkipAbort::Abort);
    }

    #[test]
    fn test_retry_skip_abort_recognizes_retry_and_skip() {
        let console = ScriptedConsole::new(vec!["r", "s"]);
        assert_eq!(console.retry_skip_abort("x"), RetrySkipAbort::Retry);
        assert_eq!(console.retry_skip_abort("x"), RetrySkipAbort::Skip);
    }

    #[test]
    fn test_progress_handle_caps_at_steps() {
        let console = ScriptedConsole::new(vec![]);
        let mut handle = console.progress_bar_with_steps("deploying", 2);
        handle.advance();
        handle.advance();
        handle.advance();
        assert_eq!(handle.current, 2);
    }
}
