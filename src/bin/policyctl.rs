//! policyctl: operator command-line tool for publishing a
//! [`pwrctld::global_policy::GlobalPolicy`] (spec section 6, "operator
//! tooling"). Thin wrapper over the library's `GlobalPolicy`/`Platform`
//! types; argument parsing follows the teacher's
//! `std::env::var(...).unwrap_or_else(...)` style rather than pulling in
//! a CLI-argument crate the pack does not otherwise use.
//!
//! Usage:
//!   policyctl set <descriptor> <mode> [key=value ...]
//!   policyctl enforce-static <descriptor>
//!
//! `<descriptor>` is a file path or a `/name` shared-memory object name
//! (spec section 4.6/6). `<mode>` is one of the JSON mode strings.
//! Recognized keys: budget_watts, frequency_mhz, tdp_percent,
//! num_max_perf, affinity, goal.

use anyhow::{bail, Context, Result};

use pwrctld::global_policy::{GlobalPolicy, PolicyDescriptor};
use pwrctld::platform;
use pwrctld::policy::{Affinity, Goal, Mode};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        std::process::exit(2);
    };

    match command.as_str() {
        "set" => run_set(&args[1..]),
        "enforce-static" => run_enforce_static(&args[1..]),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        other => bail!("unknown subcommand '{other}'"),
    }
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  policyctl set <descriptor> <mode> [key=value ...]");
    eprintln!("  policyctl enforce-static <descriptor>");
}

fn run_set(args: &[String]) -> Result<()> {
    let [descriptor, mode, rest @ ..] = args else {
        bail!("usage: policyctl set <descriptor> <mode> [key=value ...]");
    };

    let mode = Mode::from_json_str(mode).with_context(|| format!("unknown mode '{mode}'"))?;
    let mut policy = GlobalPolicy::new(None, Some(PolicyDescriptor::parse(descriptor)));
    policy.set_mode(mode);

    for pair in rest {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("expected key=value, got '{pair}'"))?;
        apply_field(&mut policy, key, value)?;
    }

    policy.write().context("failed to publish policy")?;
    println!("published mode={mode:?} to {descriptor}");
    Ok(())
}

fn apply_field(policy: &mut GlobalPolicy, key: &str, value: &str) -> Result<()> {
    match key {
        "budget_watts" => policy.set_budget_watts(value.parse().context("budget_watts must be a number")?),
        "frequency_mhz" => policy.set_frequency_mhz(value.parse().context("frequency_mhz must be an integer")?),
        "tdp_percent" => policy.set_tdp_percent(value.parse().context("tdp_percent must be an integer")?),
        "num_max_perf" => policy.set_num_max_perf(value.parse().context("num_max_perf must be an integer")?),
        "affinity" => {
            let affinity = Affinity::from_json_str(value).with_context(|| format!("unknown affinity '{value}'"))?;
            policy.set_affinity(affinity);
        }
        "goal" => {
            let goal = match value {
                "performance" => Goal::Performance,
                "efficiency" => Goal::Efficiency,
                "balanced" => Goal::Balanced,
                other => bail!("unknown goal '{other}'"),
            };
            policy.set_goal(goal);
        }
        other => bail!("unknown field '{other}'"),
    }
    Ok(())
}

fn run_enforce_static(args: &[String]) -> Result<()> {
    let [descriptor] = args else {
        bail!("usage: policyctl enforce-static <descriptor>");
    };
    let mut policy = GlobalPolicy::new(Some(PolicyDescriptor::parse(descriptor)), None);
    let mut platform = platform::default_platform().context("failed to open platform")?;
    policy.enforce_static_mode(&mut platform).context("enforce_static_mode failed")?;
    println!("enforced static mode from {descriptor}");
    Ok(())
}
