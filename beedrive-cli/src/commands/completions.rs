//! Shell completion generation.

use clap::CommandFactory;
use clap_complete::{Shell, generate};
use std::io;

use crate::Cli;

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd
        .get_name()
        .to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(shell: Shell) -> String {
        let mut cmd = Cli::command();
        let mut out = Vec::new();
        generate(shell, &mut cmd, "beedrive", &mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_bash_completions_list_subcommands() {
        let script = render(Shell::Bash);
        assert!(script.contains("_beedrive()"));
        assert!(script.contains("clear-shutdown"));
    }

    #[test]
    fn test_fish_completions_name_binary() {
        assert!(render(Shell::Fish).contains("complete -c beedrive"));
    }
}
