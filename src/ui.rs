//! Interface de terminal do agente: spinner e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`TerminalConsole`] é o [`ConsoleSink`] usado
//! pelo listener de console durante a execução de um job.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::listeners::ConsoleSink;
use crate::state_machine::{JobProcessResult, JobStatus};

/// Saída do agente no terminal.
///
/// O passo atual aparece no spinner; cada passo concluído vira uma linha.
/// Avisos saem em amarelo e erros em vermelho.
pub struct TerminalConsole {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para sucesso.
    green: Style,
    // Estilo vermelho para erros.
    red: Style,
    // Estilo amarelo para avisos e retentativas.
    yellow: Style,
    // Estilo atenuado para os passos.
    dim: Style,
}

impl TerminalConsole {
    /// Inicia o spinner e retorna o console.
    pub fn start() -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Exibe o resultado final do job.
    ///
    /// Sucesso é mostrado em verde com checkmark; falha e kill em vermelho com X.
    pub fn print_outcome(&self, status: JobStatus, result: Option<&JobProcessResult>) {
        let message = result.map_or_else(|| status.to_string(), |r| r.status_message.clone());
        match status {
            JobStatus::Succeeded => println!("  {} {message}", self.green.apply_to("✓")),
            _ => println!("  {} {message} ({status})", self.red.apply_to("✗")),
        }
    }
}

impl ConsoleSink for TerminalConsole {
    fn info(&self, message: &str) {
        self.pb.println(format!("  {}", self.dim.apply_to(message)));
        self.pb.set_message(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.yellow.apply_to("↻")));
    }

    fn error(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.red.apply_to("✗")));
    }

    fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
