//! Specialized executors (§4.6-§4.10) plus the two Step-shaped adapters
//! that wrap a child-DAG run (§4.13, §4.14). `command` and `shell_builder`
//! hold the local-process plumbing every other executor in this module
//! either delegates to (docker, ssh, git-checkout shell out to their own
//! CLI tools the same way) or is independent of (http, jq, mail).
pub mod command;
pub mod dag;
pub mod docker;
pub mod git_checkout;
pub mod http;
pub mod jq;
pub mod mail;
pub mod parallel;
pub mod shell_builder;
pub mod ssh;

use crate::registry::Registry;

/// Build the canonical registry wiring every executor type named in §4.1:
/// `""`/`"command"`/`"shell"` all resolve to the command executor (the step
/// shape, not the type string, decides direct-exec vs shell-wrapped), plus
/// the specialized types and the `"dag"`/`"parallel"` Step adapters. A
/// legacy alias for `"dag"` is registered as the spec requires.
pub fn build_default_registry() -> Registry {
    let mut reg = Registry::new();
    reg.register("", command::constructor, None);
    reg.register("command", command::constructor, None);
    reg.register("shell", command::constructor, None);
    reg.register("http", http::HttpExecutor::from_step, None);
    reg.register("jq", jq::JqExecutor::from_step, None);
    reg.register("mail", mail::MailExecutor::from_step, None);
    reg.register(
        "ssh",
        ssh::SshExecutor::from_step,
        Some(std::sync::Arc::new(ssh::validate_step)),
    );
    reg.register("docker", docker::DockerExecutor::from_step, None);
    reg.register(
        "git-checkout",
        git_checkout::GitCheckoutExecutor::from_step,
        None,
    );
    reg.register("dag", dag::DagStepExecutor::from_step, None);
    reg.register("parallel", parallel::ParallelExecutor::from_step, None);
    reg.register_alias("legacy-dag", "dag");
    reg
}
