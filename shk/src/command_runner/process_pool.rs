//! `ProcessPoolCommandRunner`: the real, POSIX command runner (spec §4.6).
//!
//! Each invocation forks `/bin/sh -c <command>` (via `std::process::Command`,
//! which uses `posix_spawn` under the hood) and a dedicated waiter thread
//! blocks on the child's exit, then reports the result back over a
//! `crossbeam_channel`. The scheduler thread's `run_commands()` blocks on
//! that channel rather than on raw `pselect`/`ppoll` — channels are the
//! idiomatic Rust substitute for the original's manual FD-based reaping
//! loop, without pulling in an async runtime (see `DESIGN.md`).

use super::{CommandResult, CommandRunner, StepContext};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_interrupt(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        libc::signal(libc::SIGINT, handle_interrupt as usize);
        libc::signal(libc::SIGTERM, handle_interrupt as usize);
    });
}

enum Message {
    Done {
        callback: super::Callback,
        result: CommandResult,
    },
    Interrupted,
}

/// A fixed-size parallel subprocess pool. `parallelism` bounds total
/// concurrent children (the `-j` value); `load_average_ceiling` additionally
/// refuses new work while the system's 1-minute load average is too high
/// (the `-l` value).
pub struct ProcessPoolCommandRunner {
    parallelism: usize,
    load_average_ceiling: Option<f64>,
    running: AtomicUsize,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    interrupted_locally: AtomicBool,
}

impl ProcessPoolCommandRunner {
    pub fn new(parallelism: usize, load_average_ceiling: Option<f64>) -> Arc<Self> {
        install_signal_handlers();
        let (tx, rx) = bounded(4096);
        let runner = Arc::new(ProcessPoolCommandRunner {
            parallelism: parallelism.max(1),
            load_average_ceiling,
            running: AtomicUsize::new(0),
            tx,
            rx,
            interrupted_locally: AtomicBool::new(false),
        });
        runner.spawn_signal_watcher();
        runner
    }

    fn spawn_signal_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_millis(25));
            let Some(this) = weak.upgrade() else { return };
            if INTERRUPTED.load(Ordering::SeqCst) && !this.interrupted_locally.swap(true, Ordering::SeqCst) {
                let _ = this.tx.send(Message::Interrupted);
                return;
            }
        });
    }

    fn load_average_ok(&self) -> bool {
        let Some(ceiling) = self.load_average_ceiling else {
            return true;
        };
        let mut averages = [0f64; 3];
        // SAFETY: `averages` has room for the 3 values `getloadavg` writes.
        let n = unsafe { libc::getloadavg(averages.as_mut_ptr(), 3) };
        if n <= 0 {
            return true;
        }
        averages[0] <= ceiling
    }
}

impl CommandRunner for ProcessPoolCommandRunner {
    fn invoke(&self, ctx: StepContext, callback: super::Callback) {
        self.running.fetch_add(1, Ordering::SeqCst);
        let tx = self.tx.clone();
        let console = ctx.console;
        std::thread::spawn(move || {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(&ctx.command);
            if console {
                command.stdin(Stdio::inherit());
                command.stdout(Stdio::inherit());
                command.stderr(Stdio::inherit());
            } else {
                command.stdin(Stdio::null());
                command.stdout(Stdio::piped());
                command.stderr(Stdio::piped());
            }

            let result = match command.spawn() {
                Ok(mut child) => {
                    let mut output = String::new();
                    if !console {
                        if let Some(mut out) = child.stdout.take() {
                            let _ = out.read_to_string(&mut output);
                        }
                        if let Some(mut err) = child.stderr.take() {
                            let mut buf = String::new();
                            let _ = err.read_to_string(&mut buf);
                            output.push_str(&buf);
                        }
                    }
                    match child.wait() {
                        Ok(status) => CommandResult {
                            success: status.success(),
                            output,
                            input_files: Vec::new(),
                            output_files: Vec::new(),
                        },
                        Err(e) => CommandResult {
                            success: false,
                            output: format!("failed to wait for child: {e}"),
                            input_files: Vec::new(),
                            output_files: Vec::new(),
                        },
                    }
                }
                Err(e) => CommandResult {
                    success: false,
                    output: format!("failed to start command: {e}"),
                    input_files: Vec::new(),
                    output_files: Vec::new(),
                },
            };
            let _ = tx.send(Message::Done { callback, result });
        });
    }

    fn size(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn can_run_more(&self) -> bool {
        self.running.load(Ordering::SeqCst) < self.parallelism && self.load_average_ok()
    }

    fn run_commands(&self) -> bool {
        match self.rx.recv() {
            Ok(Message::Done { callback, result }) => {
                self.running.fetch_sub(1, Ordering::SeqCst);
                callback(result);
                // Drain any other already-ready completions without blocking,
                // so a burst of finishes in one scheduler tick is processed
                // in one `run_commands` call.
                while let Ok(msg) = self.rx.try_recv() {
                    match msg {
                        Message::Done { callback, result } => {
                            self.running.fetch_sub(1, Ordering::SeqCst);
                            callback(result);
                        }
                        Message::Interrupted => return true,
                    }
                }
                false
            }
            Ok(Message::Interrupted) => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::StepId;
    use std::sync::mpsc;

    fn ctx(command: &str) -> StepContext {
        StepContext {
            step_id: StepId(0),
            command: command.to_string(),
            pool_name: String::new(),
            generator: false,
            console: false,
        }
    }

    #[test]
    fn runs_a_command_and_reports_success() {
        let runner = ProcessPoolCommandRunner::new(1, None);
        let (tx, rx) = mpsc::channel();
        runner.invoke(
            ctx("exit 0"),
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        runner.run_commands();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.success);
    }

    #[test]
    fn reports_failure_for_nonzero_exit() {
        let runner = ProcessPoolCommandRunner::new(1, None);
        let (tx, rx) = mpsc::channel();
        runner.invoke(
            ctx("exit 7"),
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        runner.run_commands();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!result.success);
    }
}
