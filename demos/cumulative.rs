use clap::Parser;

use sparse_mc::config::SolverConfig;
use sparse_mc::measures::{Model, Solver};
use sparse_mc::mtbdd::Mtbdd;
use sparse_mc::odd::Odd;
use sparse_mc::types::VarSet;

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Queue capacity (number of states is capacity + 1).
    #[arg(value_name = "INT", default_value = "100")]
    capacity: u64,

    /// Step bound.
    #[clap(long, value_name = "INT", default_value = "50")]
    bound: i64,

    /// Arrival probability per step.
    #[clap(long, value_name = "FLOAT", default_value = "0.3")]
    arrive: f64,

    /// Service probability per step.
    #[clap(long, value_name = "FLOAT", default_value = "0.4")]
    serve: f64,

    /// Disable the compact encodings.
    #[clap(long)]
    no_compact: bool,

    /// MTBDD size (in bits, so the actual size is `2^size` nodes).
    #[clap(
        long,
        value_name = "INT",
        default_value = "20",
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(2..=31)
    )]
    size: usize,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let dd = Mtbdd::new(args.size);
    let num_states = args.capacity + 1;
    let num_vars = (u64::BITS - args.capacity.max(1).leading_zeros()) as usize;
    let (rows, cols) = VarSet::interleaved(1, num_vars);
    println!("Encoding discrete-time queue with {} states over {} variables", num_states, num_vars);

    // Each step: one arrival w.p. `arrive` (if not full), one departure w.p. `serve` (if not empty).
    let mut entries = vec![];
    for i in 0..num_states {
        let up = if i < args.capacity { args.arrive * (1.0 - args.serve) } else { 0.0 };
        let down = if i > 0 { args.serve * (1.0 - args.arrive) } else { 0.0 };
        if up > 0.0 {
            entries.push((i, i + 1, up));
        }
        if down > 0.0 {
            entries.push((i, i - 1, down));
        }
        entries.push((i, i, 1.0 - up - down));
    }
    let trans = dd.encode_matrix(&entries, &rows, &cols)?;
    let reach = dd.encode_vector(&vec![1.0; num_states as usize], &rows)?;
    let odd = Odd::build(&dd, reach, &rows)?;
    println!("MTBDD nodes: {}", dd.num_nodes());

    // Reward: queue length.
    let lengths: Vec<f64> = (0..num_states).map(|i| i as f64).collect();
    let rewards = dd.encode_vector(&lengths, &rows)?;

    let config = SolverConfig {
        compact: !args.no_compact,
        ..SolverConfig::default()
    };
    let solver = Solver::new(&dd, &config);
    let model = Model {
        trans,
        rows: &rows,
        cols: &cols,
        index: &odd,
    };
    let sol = solver.cumulative_reward(&model, rewards, dd.zero, args.bound)?;

    println!("report: {}", sol.report);
    for i in [0, num_states / 2, num_states - 1] {
        println!("R<={} [C] from {} = {:.6}", args.bound, i, sol.values[i as usize]);
    }

    let time_total = time_total.elapsed();
    println!("Done in {:.3} s", time_total.as_secs_f64());

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_size_range() {
        let args = Cli::try_parse_from(["cumulative", "--size", "31"]).unwrap();
        assert_eq!(args.size, 31);
        assert_eq!(Cli::try_parse_from(["cumulative"]).unwrap().size, 20);
        assert!(Cli::try_parse_from(["cumulative", "--size", "32"]).is_err());
        assert!(Cli::try_parse_from(["cumulative", "--size", "1"]).is_err());
    }
}
