//! Saída de terminal do jobnet: spinner durante a finalização e relatório
//! colorido.
//!
//! Usa `indicatif` para o spinner e `console` para as cores. Os logs do
//! `tracing` vão para stderr; o relatório vai para stdout.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::{FinalizeAction, FinalizeReport};
use crate::state_machine::RunStatus;

/// Spinner mostrado enquanto uma execução é finalizada.
pub struct FinalizeProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl FinalizeProgress {
    /// Inicia o spinner para a execução informada.
    pub fn start(run_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("finalizing {run_id}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Encerra o spinner e imprime o relatório.
    pub fn finish(&self, report: &FinalizeReport) {
        self.pb.finish_and_clear();
        print_report_with(report, &self.green, &self.red, &self.yellow);
    }
}

/// Imprime um relatório sem spinner (usado pela demonstração).
pub fn print_report(report: &FinalizeReport) {
    print_report_with(
        report,
        &Style::new().green().bold(),
        &Style::new().red().bold(),
        &Style::new().yellow(),
    );
}

fn print_report_with(report: &FinalizeReport, green: &Style, red: &Style, yellow: &Style) {
    let status_style = match report.final_status.status {
        RunStatus::Completed => green,
        RunStatus::Failed => red,
        RunStatus::Waiting | RunStatus::Delegating => yellow,
    };
    println!(
        "  {} {} [{}] {}",
        status_style.apply_to(report.final_status.status),
        report.job_definition_id,
        report.run_id,
        report.final_status.message
    );
    println!("    {}", action_line(&report.action));
    println!(
        "{}",
        serde_json::to_string_pretty(report).unwrap_or_default()
    );
}

/// Descrição curta de uma ação, uma linha.
pub fn action_line(action: &FinalizeAction) -> String {
    match action {
        FinalizeAction::Redispatched {
            kind,
            attempt,
            new_run_id,
        } => format!("↻ {kind} attempt {attempt} dispatched as {new_run_id}"),
        FinalizeAction::ParentNotified {
            parent_id,
            new_run_id,
        } => format!("↑ parent {parent_id} dispatched as {new_run_id}"),
        FinalizeAction::ParentSkipped { parent_id, reason } => match parent_id {
            Some(parent) => format!("· parent {parent} not dispatched: {reason}"),
            None => format!("· parent not dispatched: {reason}"),
        },
        FinalizeAction::CycleStopped { cycle } => format!("■ stopped after cycle {cycle}"),
        FinalizeAction::Idle => "· nothing to dispatch".to_string(),
        FinalizeAction::NotificationFailed { parent_id, error } => match parent_id {
            Some(parent) => format!("✗ notifying {parent} failed: {error}"),
            None => format!("✗ dispatch failed: {error}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::RecoveryKind;

    #[test]
    fn action_lines_name_the_target() {
        let line = action_line(&FinalizeAction::Redispatched {
            kind: RecoveryKind::LoopRecovery,
            attempt: 2,
            new_run_id: "run-9".into(),
        });
        assert_eq!(line, "↻ loop-recovery attempt 2 dispatched as run-9");

        let line = action_line(&FinalizeAction::ParentSkipped {
            parent_id: Some("p".into()),
            reason: "cooldown active".into(),
        });
        assert_eq!(line, "· parent p not dispatched: cooldown active");
    }
}
