//! The four operator-facing operations.
//!
//! Each operation declares its resources into a [`Store`] and hands the store
//! to [`execute`], which either prints the plan (dry run) or applies it.
use colored::{ColoredString, Colorize};

use crate::{aws::AwsContext, config::Config, names::Names, Action, Applied, Plan, Result, Store};

pub mod deploy;
pub mod image;
pub mod provision;
pub mod teardown;

/// Everything an operation needs to know about where it runs.
#[derive(Clone, Debug)]
pub struct Session {
    pub aws: AwsContext,
    pub config: Config,
    pub names: Names,
    /// Print plans instead of applying them.
    pub dry_run: bool,
}

impl Session {
    pub fn store(&self) -> Store<AwsContext> {
        Store::new(self.aws.clone())
    }
}

fn paint(action: Action) -> ColoredString {
    let text = action.to_string();
    match action {
        Action::Ensure => text.green(),
        Action::Lookup => text.cyan(),
        Action::Destroy => text.red(),
    }
}

/// Print a plan to stdout, one line per resource.
pub fn print_plan<P>(title: &str, plan: &Plan<P>) {
    println!("{}", title.bold());
    if plan.is_empty() {
        println!("  No changes.");
        return;
    }
    for action in plan.actions.iter() {
        println!(
            "  {} '{}' [{}]",
            paint(action.action),
            action.id,
            action.short_type_name().dimmed()
        );
    }
}

/// Plan everything declared in `store`, then print or apply it.
///
/// A dry run returns no outcomes.
pub async fn execute<P: 'static>(
    title: &str,
    store: &mut Store<P>,
    dry_run: bool,
) -> Result<Vec<Applied>> {
    let plan = store.plan()?;
    if dry_run {
        print_plan(title, &plan);
        return Ok(vec![]);
    }
    log::info!(
        "{title}: applying {} resources in {} batches",
        plan.actions.len(),
        plan.batch_count()
    );
    store.apply(plan).await
}
