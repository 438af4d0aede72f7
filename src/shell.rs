/*! Child-process runner with non-blocking output streaming.

The bootloader build and flash helpers shell out to `make` and `avrdude`,
which can run for minutes; their stdout and stderr lines are surfaced as
they are produced so the engine stays responsive while they do.
*/
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::Result;

/// One line of child output, tagged by stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A stdout line.
    Stdout(String),
    /// A stderr line.
    Stderr(String),
}

/// A spawned command whose output arrives line by line.
pub struct RunningCommand {
    lines: mpsc::Receiver<OutputLine>,
    child: tokio::process::Child,
}

impl RunningCommand {
    /// Next output line, `None` once both streams are closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Wait for the child to exit.
    pub async fn wait(mut self) -> Result<ExitStatus> {
        // Drain so the pumps never block on a full channel.
        while self.lines.recv().await.is_some() {}
        Ok(self.child.wait().await?)
    }
}

/// Start `command` under the shell, streams piped.
pub fn run(command: &str, workdir: Option<&Path>) -> Result<RunningCommand> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    let mut child = cmd.spawn()?;
    let (tx, rx) = mpsc::channel(64);
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if out_tx.send(OutputLine::Stdout(line)).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(OutputLine::Stderr(line)).await.is_err() {
                break;
            }
        }
    });
    Ok(RunningCommand { lines: rx, child })
}

/// Run a command to completion, forwarding its output to the log.
pub async fn run_to_log(command: &str, workdir: Option<&Path>) -> Result<ExitStatus> {
    info!("$ {command}");
    let mut running = run(command, workdir)?;
    while let Some(line) = running.next_line().await {
        match line {
            OutputLine::Stdout(l) => info!("{l}"),
            OutputLine::Stderr(l) => warn!("{l}"),
        }
    }
    running.wait().await
}

/// Paths to the local AVR flashing tools.
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// The `avrdude` binary.
    pub avrdude: PathBuf,
    /// Its configuration file.
    pub avrconf: PathBuf,
}

impl Toolchain {
    fn avrcmd(&self) -> String {
        format!(
            "{} -c USBasp -p m168p -C {}",
            self.avrdude.display(),
            self.avrconf.display()
        )
    }

    /// Build the bootloader with the node's serial number baked in.
    pub async fn compile_bootloader(
        &self,
        make: &str,
        env: &str,
        address: u16,
        workdir: &Path,
    ) -> Result<ExitStatus> {
        let command = format!(
            "{make} ENV={env} BAUD_RATE=38400 LED=D2 LED_START_FLASHES=5 \
             SN_MAJOR={} SN_MINOR={} pro8",
            address / 0xff,
            address % 0xff
        );
        run_to_log(&command, Some(workdir)).await
    }

    /// Flash a compiled bootloader over the local ISP programmer.
    pub async fn flash_bootloader(&self, bootloader: &Path) -> Result<ExitStatus> {
        let command = format!(
            "{} -u -U flash:w:\"{}\":i -vv",
            self.avrcmd(),
            bootloader.display()
        );
        run_to_log(&command, None).await
    }

    /// Write the fuse bytes.
    pub async fn update_fuses(&self, low: u8, high: u8, extended: u8) -> Result<ExitStatus> {
        let command = format!(
            "{} -U lfuse:w:{low}:m -U hfuse:w:{high}:m -U efuse:w:{extended}:m",
            self.avrcmd()
        );
        run_to_log(&command, None).await
    }
}
