//! Interface de linha de comando do jobnet baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (finalize, siblings,
//! demo) e flags globais (--config, --max-cycles, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::orchestrator::{FinalizeAction, FinalizeReport};
use crate::recovery::StopFlag;

/// Código de saída de `finalize` quando o sinal de parada foi levantado: um
/// job raiz cíclico atingiu o limite e o supervisor não deve iniciar novos
/// ciclos.
pub const EXIT_CYCLES_STOPPED: u8 = 3;

/// Código de saída de `siblings` enquanto algum filho ainda está rodando.
pub const EXIT_SIBLINGS_PENDING: u8 = 2;

/// jobnet: inferência de status e notificação de pais em DAGs de jobs.
#[derive(Debug, Parser)]
#[command(name = "jobnet", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = "jobnet.toml")]
    pub config: PathBuf,

    /// Limite global de ciclos para jobs raiz cíclicos.
    #[arg(long, global = true)]
    pub max_cycles: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Finaliza uma execução descrita em JSON contra o record store HTTP.
    Finalize {
        /// Arquivo JSON com a conclusão da execução.
        #[arg(long)]
        file: PathBuf,
    },

    /// Consulta quais irmãos ainda bloqueiam a notificação de um pai.
    Siblings {
        /// Id da definição de job pai.
        parent: String,

        /// Id do filho a excluir da verificação.
        #[arg(long)]
        exclude: Option<String>,
    },

    /// Executa cenários de demonstração com o store em memória.
    Demo,
}

/// Traduz o resultado de `finalize` em código de saída para o supervisor.
pub fn finalize_exit_code(report: &FinalizeReport, stop: &StopFlag) -> u8 {
    if stop.is_raised() || matches!(report.action, FinalizeAction::CycleStopped { .. }) {
        EXIT_CYCLES_STOPPED
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::FinalStatus;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_finalize_subcommand() {
        let cli = Cli::parse_from(["jobnet", "finalize", "--file", "run.json"]);
        match cli.command {
            Command::Finalize { file } => assert_eq!(file, PathBuf::from("run.json")),
            _ => panic!("expected Finalize command"),
        }
        assert_eq!(cli.config, PathBuf::from("jobnet.toml"));
    }

    #[test]
    fn cli_parses_siblings_subcommand() {
        let cli = Cli::parse_from(["jobnet", "siblings", "job-parent", "--exclude", "job-a"]);
        match cli.command {
            Command::Siblings { parent, exclude } => {
                assert_eq!(parent, "job-parent");
                assert_eq!(exclude.as_deref(), Some("job-a"));
            }
            _ => panic!("expected Siblings command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "jobnet",
            "--config",
            "/etc/jobnet.toml",
            "--max-cycles",
            "5",
            "--verbose",
            "demo",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.max_cycles, Some(5));
        assert_eq!(cli.config, PathBuf::from("/etc/jobnet.toml"));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn stop_signal_maps_to_its_own_exit_code() {
        let report = |action| FinalizeReport {
            run_id: "run-1".into(),
            job_definition_id: "nightly".into(),
            final_status: FinalStatus::completed("completed direct work"),
            action,
        };
        let stop = StopFlag::new();

        assert_eq!(finalize_exit_code(&report(FinalizeAction::Idle), &stop), 0);
        assert_eq!(
            finalize_exit_code(&report(FinalizeAction::CycleStopped { cycle: 3 }), &stop),
            EXIT_CYCLES_STOPPED
        );

        stop.raise("nightly reached max cycles");
        assert_eq!(
            finalize_exit_code(&report(FinalizeAction::Idle), &stop),
            EXIT_CYCLES_STOPPED
        );
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
