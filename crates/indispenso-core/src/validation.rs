//! Output validation of a command that finished executing.

use crate::cmd::Cmd;
use crate::template::{Template, ValidationRule};
use crate::types::{CmdState, OutputStream};

/// Whether `rule` holds for the given output lines.
pub fn rule_passes(rule: &ValidationRule, lines: &[String]) -> bool {
    let found = lines.iter().any(|line| line.contains(&rule.text));
    found == rule.must_contain
}

/// Evaluate `template`'s rules in order against the buffered output of `cmd`.
///
/// Returns `FailedValidation` at the first failing rule, `Finished` otherwise.
pub fn validate(cmd: &Cmd, template: &Template) -> CmdState {
    for rule in &template.validation_rules {
        let lines = match rule.output_stream {
            OutputStream::Stdout => &cmd.buf_output,
            OutputStream::Stderr => &cmd.buf_output_err,
        };
        if !rule_passes(rule, lines) {
            tracing::info!(
                cmd_id = %cmd.id,
                stream = %rule.output_stream,
                text = %rule.text,
                must_contain = rule.must_contain,
                "validation rule failed"
            );
            return CmdState::FailedValidation;
        }
    }
    CmdState::Finished
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd_with(stdout: &[&str], stderr: &[&str]) -> Cmd {
        let mut cmd = Cmd::new("true", 5);
        cmd.buf_output = stdout.iter().map(|s| s.to_string()).collect();
        cmd.buf_output_err = stderr.iter().map(|s| s.to_string()).collect();
        cmd
    }

    fn must_contain_ok() -> Template {
        Template::new("t", "true", 5)
            .with_rule(ValidationRule::new(OutputStream::Stdout, "OK", true).unwrap())
    }

    #[test]
    fn missing_required_text_fails() {
        let cmd = cmd_with(&["all good", "done"], &[]);
        assert_eq!(validate(&cmd, &must_contain_ok()), CmdState::FailedValidation);
    }

    #[test]
    fn present_required_text_finishes() {
        let cmd = cmd_with(&["status: OK"], &[]);
        assert_eq!(validate(&cmd, &must_contain_ok()), CmdState::Finished);
    }

    #[test]
    fn forbidden_text_on_stderr_fails() {
        let template = Template::new("t", "true", 5)
            .with_rule(ValidationRule::new(OutputStream::Stderr, "error", false).unwrap());
        assert_eq!(
            validate(&cmd_with(&["error"], &[]), &template),
            CmdState::Finished
        );
        assert_eq!(
            validate(&cmd_with(&[], &["fatal error: boom"]), &template),
            CmdState::FailedValidation
        );
    }

    #[test]
    fn no_rules_always_finishes() {
        let template = Template::new("t", "true", 5);
        assert_eq!(validate(&cmd_with(&[], &[]), &template), CmdState::Finished);
    }

    #[test]
    fn rules_are_checked_in_order() {
        let template = Template::new("t", "true", 5)
            .with_rule(ValidationRule::new(OutputStream::Stdout, "OK", true).unwrap())
            .with_rule(ValidationRule::new(OutputStream::Stdout, "WARN", false).unwrap());
        assert_eq!(
            validate(&cmd_with(&["OK", "WARN disk"], &[]), &template),
            CmdState::FailedValidation
        );
        assert_eq!(
            validate(&cmd_with(&["OK"], &[]), &template),
            CmdState::Finished
        );
    }
}
