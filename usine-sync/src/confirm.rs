//! Human gate before destructive mutations.

use std::io::{BufRead, Write};
use std::sync::Mutex;

use crate::policy::{MutationPlan, Policy};

/// Decides whether a destructive plan may run.
pub trait Confirmation: Send + Sync {
    fn confirm(&self, policy: Policy, plan: &MutationPlan) -> bool;
}

/// `--force`.
pub struct AlwaysConfirm;

impl Confirmation for AlwaysConfirm {
    fn confirm(&self, _: Policy, _: &MutationPlan) -> bool {
        true
    }
}

/// `--no-input`.
pub struct NeverConfirm;

impl Confirmation for NeverConfirm {
    fn confirm(&self, _: Policy, _: &MutationPlan) -> bool {
        false
    }
}

/// Prints the plan summary and asks `Proceed? [y/N]`.
pub struct InteractiveConfirm<R, W> {
    io: Mutex<(R, W)>,
}

impl<R, W> InteractiveConfirm<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }
}

impl<R: BufRead + Send, W: Write + Send> Confirmation for InteractiveConfirm<R, W> {
    fn confirm(&self, policy: Policy, plan: &MutationPlan) -> bool {
        let Ok(mut io) = self.io.lock() else {
            return false;
        };
        let (input, output) = &mut *io;
        let summary = plan.summary();
        let prompt = writeln!(
            output,
            "{policy} will upsert {} profile(s), delete {} profile(s) and delete {} identity(ies).",
            summary.profile_upserts, summary.profile_deletes, summary.identity_deletes
        )
        .and_then(|()| write!(output, "Proceed? [y/N] "))
        .and_then(|()| output.flush());
        if prompt.is_err() {
            return false;
        }

        let mut answer = String::new();
        match input.read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}
