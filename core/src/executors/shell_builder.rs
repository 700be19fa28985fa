//! Translates (command, args, script, shell, packages) into a concrete argv
//! for POSIX shells, PowerShell, cmd.exe, or nix-shell. Pure data
//! transformation, no process spawning, so it's unit-testable in isolation.
use std::path::Path;

/// What the caller wants to run: direct exec, or through a shell with
/// either inline args or a materialized script file.
#[derive(Debug, Clone)]
pub enum Payload<'a> {
    /// `command arg1 .. argN [scriptFile]`
    CommandArgs {
        command: &'a str,
        args: &'a [String],
        script_file: Option<&'a Path>,
    },
    /// `shell -c shellCommandArgs` (or the shell-family equivalent)
    ShellArgs { shell_command_args: &'a str },
}

const ERREXIT_CAPABLE_SHELLS: &[&str] = &["sh", "bash", "zsh", "ksh", "ash", "dash"];

fn basename(shell: &str) -> &str {
    Path::new(shell)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(shell)
}

fn strip_exe(name: &str) -> &str {
    name.strip_suffix(".exe").unwrap_or(name)
}

/// Build the final argv for invoking `shell` (absolute path or bare name)
/// with `payload`. `packages` are nix-shell `-p` packages. `force_errexit`
/// requests `set -e;`/`-e` prefixing when the caller did not specify their
/// own shell string verbatim (see `errexit_capable`).
pub fn build_argv(
    shell: &str,
    packages: &[String],
    payload: &Payload,
    force_errexit: bool,
) -> Vec<String> {
    let base = strip_exe(basename(shell));

    match base {
        "nix-shell" => {
            let mut argv = vec![shell.to_string()];
            for pkg in packages {
                argv.push("-p".to_string());
                argv.push(pkg.clone());
            }
            argv.push("--pure".to_string());
            argv.push("--run".to_string());
            let run_payload = match payload {
                Payload::CommandArgs {
                    command,
                    args,
                    script_file,
                } => {
                    let mut parts = vec![command.to_string()];
                    parts.extend(args.iter().cloned());
                    if let Some(f) = script_file {
                        parts.push(f.display().to_string());
                    }
                    let joined = parts.join(" ");
                    if force_errexit {
                        format!("set -e; {}", joined)
                    } else {
                        joined
                    }
                }
                Payload::ShellArgs { shell_command_args } => shell_command_args.to_string(),
            };
            argv.push(run_payload);
            argv
        }
        "powershell" | "pwsh" => {
            let mut argv = vec![shell.to_string()];
            match payload {
                Payload::CommandArgs {
                    command,
                    args,
                    script_file,
                } => {
                    argv.push(command.to_string());
                    argv.extend(args.iter().cloned());
                    if let Some(f) = script_file {
                        argv.push(f.display().to_string());
                    }
                }
                Payload::ShellArgs { shell_command_args } => {
                    argv.push("-Command".to_string());
                    argv.push(shell_command_args.to_string());
                }
            }
            argv
        }
        "cmd" => {
            let mut argv = vec![shell.to_string()];
            match payload {
                Payload::CommandArgs {
                    command,
                    args,
                    script_file,
                } => {
                    argv.push(command.to_string());
                    argv.extend(args.iter().cloned());
                    if let Some(f) = script_file {
                        argv.push(f.display().to_string());
                    }
                }
                Payload::ShellArgs { shell_command_args } => {
                    argv.push("/c".to_string());
                    argv.push(shell_command_args.to_string());
                }
            }
            argv
        }
        // default: sh, bash, zsh, ksh, ash, dash, or anything else
        _ => {
            let mut argv = vec![shell.to_string()];
            match payload {
                Payload::CommandArgs {
                    command,
                    args,
                    script_file,
                } => {
                    argv.push(command.to_string());
                    argv.extend(args.iter().cloned());
                    if let Some(f) = script_file {
                        argv.push(f.display().to_string());
                    }
                }
                Payload::ShellArgs { shell_command_args } => {
                    if force_errexit {
                        argv.push("-e".to_string());
                    }
                    argv.push("-c".to_string());
                    argv.push(shell_command_args.to_string());
                }
            }
            argv
        }
    }
}

/// Whether `shell` is one of the POSIX shells the default-errexit policy
/// applies to.
pub fn errexit_capable(shell: &str) -> bool {
    ERREXIT_CAPABLE_SHELLS.contains(&strip_exe(basename(shell)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_wraps_args_with_dash_c() {
        let argv = build_argv(
            "/bin/bash",
            &[],
            &Payload::ShellArgs {
                shell_command_args: "echo hi",
            },
            false,
        );
        assert_eq!(argv, vec!["/bin/bash", "-c", "echo hi"]);
    }

    #[test]
    fn default_shell_with_script_skips_dash_c() {
        let script = Path::new("/tmp/script.sh");
        let argv = build_argv(
            "bash",
            &[],
            &Payload::CommandArgs {
                command: "/bin/sh",
                args: &[],
                script_file: Some(script),
            },
            false,
        );
        assert_eq!(argv, vec!["bash", "/bin/sh", "/tmp/script.sh"]);
    }

    #[test]
    fn nix_shell_appends_packages_then_pure_then_run() {
        let pkgs = vec!["jq".to_string(), "curl".to_string()];
        let argv = build_argv(
            "nix-shell",
            &pkgs,
            &Payload::ShellArgs {
                shell_command_args: "jq . file.json",
            },
            true,
        );
        assert_eq!(
            argv,
            vec![
                "nix-shell",
                "-p",
                "jq",
                "-p",
                "curl",
                "--pure",
                "--run",
                "set -e; jq . file.json",
            ]
        );
    }

    #[test]
    fn powershell_command_and_script_runs_directly() {
        let script = Path::new("C:/tmp/run.ps1");
        let argv = build_argv(
            "pwsh.exe",
            &[],
            &Payload::CommandArgs {
                command: "dotnet",
                args: &["run".to_string()],
                script_file: Some(script),
            },
            false,
        );
        assert_eq!(argv, vec!["pwsh.exe", "dotnet", "run", "C:/tmp/run.ps1"]);
    }

    #[test]
    fn cmd_uses_slash_c() {
        let argv = build_argv(
            "cmd.exe",
            &[],
            &Payload::ShellArgs {
                shell_command_args: "dir",
            },
            false,
        );
        assert_eq!(argv, vec!["cmd.exe", "/c", "dir"]);
    }

    #[test]
    fn forced_errexit_inserts_dash_e_before_dash_c_for_posix_shells() {
        let argv = build_argv(
            "/bin/sh",
            &[],
            &Payload::ShellArgs {
                shell_command_args: "false; echo X",
            },
            true,
        );
        assert_eq!(argv, vec!["/bin/sh", "-e", "-c", "false; echo X"]);
    }

    #[test]
    fn errexit_capability_matches_posix_shells_only() {
        assert!(errexit_capable("/usr/bin/bash"));
        assert!(errexit_capable("zsh"));
        assert!(!errexit_capable("powershell.exe"));
        assert!(!errexit_capable("nix-shell"));
    }
}
