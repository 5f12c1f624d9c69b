//! Interactive window manager prompt.

use std::io::{self, BufRead, BufReader, Stdin, Stderr, Write};

use lxsm_core::WindowManagerSelector;
use lxsm_core::process::{WindowManagerInfo, find_program};
use tracing::warn;

const MAX_ATTEMPTS: usize = 3;

/// Asks the user to pick a window manager on a text terminal.
pub struct PromptSelector<R, W> {
    input: R,
    output: W,
}

impl PromptSelector<BufReader<Stdin>, Stderr> {
    /// Prompts on stderr and reads the answer from stdin.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stderr())
    }
}

impl<R: BufRead, W: Write> PromptSelector<R, W> {
    pub const fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn prompt(&mut self, candidates: &[WindowManagerInfo]) -> io::Result<Option<String>> {
        writeln!(self.output, "No window manager is configured.")?;
        if candidates.is_empty() {
            writeln!(self.output, "None of the known window managers is installed.")?;
        }
        for (i, wm) in candidates.iter().enumerate() {
            writeln!(self.output, "  {}) {}", i + 1, wm.command)?;
        }

        for _ in 0..MAX_ATTEMPTS {
            write!(
                self.output,
                "Enter a number or a command line (empty to cancel): "
            )?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let answer = line.trim();
            if answer.is_empty() {
                return Ok(None);
            }

            if let Ok(index) = answer.parse::<usize>() {
                match index.checked_sub(1).and_then(|i| candidates.get(i)) {
                    Some(wm) => return Ok(Some(wm.command.clone())),
                    None => {
                        writeln!(self.output, "No entry {index}.")?;
                        continue;
                    },
                }
            }

            let program = answer.split_whitespace().next().unwrap_or(answer);
            if find_program(program).is_some() {
                return Ok(Some(answer.to_string()));
            }
            writeln!(self.output, "'{program}' was not found.")?;
        }
        Ok(None)
    }
}

impl<R, W> WindowManagerSelector for PromptSelector<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn select(&mut self, candidates: &[WindowManagerInfo]) -> Option<String> {
        match self.prompt(candidates) {
            Ok(choice) => choice,
            Err(e) => {
                warn!("window manager prompt failed: {e}");
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn candidates() -> Vec<WindowManagerInfo> {
        vec![
            WindowManagerInfo {
                command: "openbox".to_string(),
                path: Some("/usr/bin/openbox".into()),
            },
            WindowManagerInfo {
                command: "kwin_x11".to_string(),
                path: Some("/usr/bin/kwin_x11".into()),
            },
        ]
    }

    fn select(input: &str) -> (Option<String>, String) {
        let mut output = Vec::new();
        let choice = PromptSelector::new(Cursor::new(input.as_bytes()), &mut output)
            .select(&candidates());
        (choice, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_select_by_number() {
        let (choice, output) = select("2\n");
        assert_eq!(choice.as_deref(), Some("kwin_x11"));
        assert!(output.contains("1) openbox"));
    }

    #[test]
    fn test_select_by_command() {
        let (choice, _) = select("sh -c true\n");
        assert_eq!(choice.as_deref(), Some("sh -c true"));
    }

    #[test]
    fn test_empty_answer_cancels() {
        assert_eq!(select("\n").0, None);
        assert_eq!(select("").0, None);
    }

    #[test]
    fn test_invalid_answers_are_retried() {
        let (choice, output) = select("9\nlxsm-no-such-wm\n1\n");
        assert_eq!(choice.as_deref(), Some("openbox"));
        assert!(output.contains("No entry 9."));
        assert!(output.contains("'lxsm-no-such-wm' was not found."));
    }

    #[test]
    fn test_gives_up_after_attempts() {
        assert_eq!(select("0\n0\n0\n1\n").0, None);
    }
}
