//! Collaborator tasks run as external programs.
//!
//! Each task name maps to a `[tasks.commands.<name>]` entry holding a program
//! and an argument template. Placeholders are expanded per request:
//!
//!   args = ["combine", "{inputs}", "-o", "{output}", "--bias={bias}"]
//!
//! `{inputs}` standing alone becomes one argument per frame. An argument whose
//! placeholder has no value (no master bias yet, interactive mode off) is
//! dropped instead of being passed half-empty.

use crate::config::{CommandSpec, TasksConfig};
use crate::tasks::{Placeholders, ReductionTasks, TaskError, TaskRequest, TaskResult};

use regex::Regex;
use std::fs;
use std::io;
use std::process::{Command, Stdio};
use tracing::debug;

const PLACEHOLDER_RE: &str = r"\{([a-z0-9_]+)\}";
/// Lines of stderr quoted in a failure message.
const STDERR_TAIL: usize = 5;

pub struct CommandTasks {
    config: TasksConfig,
}

impl CommandTasks {
    pub fn new(config: TasksConfig) -> Self {
        Self { config }
    }

    fn spec(&self, task: &'static str) -> TaskResult<&CommandSpec> {
        self.config.commands.get(task).ok_or_else(|| TaskError::Failed {
            task,
            message: "no command configured".into(),
        })
    }
}

impl ReductionTasks for CommandTasks {
    fn run(&mut self, request: &TaskRequest) -> TaskResult<()> {
        let task = request.name();
        let spec = self.spec(task)?;
        let args = expand_args(task, &spec.args, &request.placeholders())?;

        if let Some(parent) = request.output().parent() {
            fs::create_dir_all(parent)?;
        }
        // The output check below must only see what this run wrote.
        match fs::remove_file(request.output()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!("{}: {} {}", task, spec.program, args.join(" "));
        let mut cmd = Command::new(&spec.program);
        cmd.args(&args);

        let (status, stderr) = if request.is_interactive() {
            let status = cmd
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(|e| spawn_error(task, &spec.program, e))?;
            (status, String::new())
        } else {
            let output = cmd
                .stdin(Stdio::null())
                .output()
                .map_err(|e| spawn_error(task, &spec.program, e))?;
            (output.status, String::from_utf8_lossy(&output.stderr).into_owned())
        };

        if !status.success() {
            let tail = tail(&stderr);
            return Err(match (request, status.code()) {
                (TaskRequest::Rectify { .. }, Some(code))
                    if code == self.config.wavelength_exit_code =>
                {
                    TaskError::Wavelength(tail)
                }
                (TaskRequest::Extract1d { .. }, Some(code))
                    if code == self.config.degenerate_exit_code =>
                {
                    TaskError::Degenerate(tail)
                }
                (_, code) => TaskError::Failed {
                    task,
                    message: match code {
                        Some(code) => format!("exit status {}: {}", code, tail),
                        None => format!("terminated by signal: {}", tail),
                    },
                },
            });
        }

        if !request.output().exists() {
            return Err(TaskError::Failed {
                task,
                message: format!("did not write {}", request.output().display()),
            });
        }
        Ok(())
    }
}

fn spawn_error(task: &'static str, program: &str, e: std::io::Error) -> TaskError {
    TaskError::Failed {
        task,
        message: format!("cannot start {}: {}", program, e),
    }
}

fn tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL);
    lines[start..].join(" | ")
}

/// Expand an argument template against a request's placeholder values.
pub fn expand_args(
    task: &'static str,
    template: &[String],
    values: &Placeholders,
) -> TaskResult<Vec<String>> {
    let re = Regex::new(PLACEHOLDER_RE).map_err(|e| TaskError::Failed {
        task,
        message: e.to_string(),
    })?;

    let mut out = Vec::new();
    'args: for arg in template {
        let names: Vec<&str> = re
            .captures_iter(arg)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if names.is_empty() {
            out.push(arg.clone());
            continue;
        }

        // A lone list placeholder spreads over several arguments.
        if names.len() == 1 && arg == &format!("{{{}}}", names[0]) {
            out.extend(lookup(task, values, names[0])?.iter().cloned());
            continue;
        }

        let mut expanded = arg.clone();
        for name in names {
            let value = lookup(task, values, name)?;
            if value.is_empty() {
                continue 'args;
            }
            expanded = expanded.replace(&format!("{{{}}}", name), &value.join(","));
        }
        out.push(expanded);
    }
    Ok(out)
}

fn lookup<'v>(task: &'static str, values: &'v Placeholders, name: &str) -> TaskResult<&'v [String]> {
    values
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v.as_slice())
        .ok_or_else(|| TaskError::Failed {
            task,
            message: format!("unknown placeholder {{{}}}", name),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn lists_spread_and_missing_values_drop_the_argument() {
        let request = TaskRequest::CombineFrames {
            inputs: vec!["b1.fits".into(), "b2.fits".into(), "b3.fits".into()],
            kappa: 15.0,
            bias: None,
            output: "out/MASTER_BIAS.fits".into(),
        };
        let template = strings(&["combine", "{inputs}", "-o", "{output}", "--kappa={kappa}", "--bias={bias}"]);
        let args = expand_args("combine-frames", &template, &request.placeholders()).unwrap();
        assert_eq!(
            args,
            strings(&[
                "combine",
                "b1.fits",
                "b2.fits",
                "b3.fits",
                "-o",
                "out/MASTER_BIAS.fits",
                "--kappa=15"
            ])
        );
    }

    #[test]
    fn interactive_flag_is_present_only_when_requested() {
        let template = strings(&["extract", "{input}", "-o", "{output}", "{interactive}"]);
        let mut request = TaskRequest::Extract1d {
            input: "FLUX2D_A.fits".into(),
            interactive: false,
            output: "FLUX1D_A.fits".into(),
        };
        let args = expand_args("extract-1d", &template, &request.placeholders()).unwrap();
        assert_eq!(args, strings(&["extract", "FLUX2D_A.fits", "-o", "FLUX1D_A.fits"]));

        if let TaskRequest::Extract1d { interactive, .. } = &mut request {
            *interactive = true;
        }
        let args = expand_args("extract-1d", &template, &request.placeholders()).unwrap();
        assert_eq!(args.last().map(String::as_str), Some("--interactive"));
    }

    #[test]
    fn unknown_placeholder_is_a_task_failure() {
        let request = TaskRequest::Combine2d {
            inputs: vec!["a.fits".into()],
            output: "c.fits".into(),
        };
        let err = expand_args("combine-2d", &strings(&["--sky={sky}"]), &request.placeholders())
            .unwrap_err();
        assert!(matches!(err, TaskError::Failed { task: "combine-2d", .. }));
    }

    #[cfg(unix)]
    fn shell_tasks(task: &str, script: &str) -> CommandTasks {
        let mut commands = BTreeMap::new();
        commands.insert(
            task.to_string(),
            CommandSpec {
                program: "sh".into(),
                args: strings(&["-c", script]),
            },
        );
        CommandTasks::new(TasksConfig {
            wavelength_exit_code: 3,
            degenerate_exit_code: 4,
            commands,
        })
    }

    #[cfg(unix)]
    #[test]
    fn exit_codes_map_to_task_errors() {
        let dir = tempfile::tempdir().unwrap();
        let rectify = TaskRequest::Rectify {
            input: "CORR2D_A.fits".into(),
            arc: "arc.fits".into(),
            pixtable: "pixtab.dat".into(),
            order_wl: 4,
            order_2d: 5,
            dispaxis: 2,
            output: dir.path().join("RECT2D_A.fits"),
        };

        let mut tasks = shell_tasks("rectify", "echo 'rms too large' >&2; exit 3");
        let err = tasks.run(&rectify).unwrap_err();
        assert!(matches!(err, TaskError::Wavelength(ref m) if m == "rms too large"));

        let mut tasks = shell_tasks("rectify", "exit 1");
        let err = tasks.run(&rectify).unwrap_err();
        assert!(matches!(err, TaskError::Failed { task: "rectify", .. }));

        // Success without the promised output is still a failure.
        let mut tasks = shell_tasks("rectify", "exit 0");
        let err = tasks.run(&rectify).unwrap_err();
        assert!(matches!(err, TaskError::Failed { ref message, .. } if message.starts_with("did not write")));

        let mut tasks = shell_tasks("rectify", "touch {output}");
        tasks.run(&rectify).unwrap();
        assert!(rectify.output().exists());

        // A product left by an earlier run does not count as output.
        let mut tasks = shell_tasks("rectify", "exit 0");
        let err = tasks.run(&rectify).unwrap_err();
        assert!(matches!(err, TaskError::Failed { ref message, .. } if message.starts_with("did not write")));
        assert!(!rectify.output().exists());
    }

    #[test]
    fn unconfigured_task_fails() {
        let mut tasks = CommandTasks::new(TasksConfig {
            wavelength_exit_code: 3,
            degenerate_exit_code: 4,
            commands: BTreeMap::new(),
        });
        let request = TaskRequest::Combine2d {
            inputs: vec![],
            output: "c.fits".into(),
        };
        let err = tasks.run(&request).unwrap_err();
        assert!(matches!(err, TaskError::Failed { task: "combine-2d", .. }));
    }
}
