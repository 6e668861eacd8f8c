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
    #[arg(value_name = "INT", default_value = "30")]
    capacity: u64,

    /// Arrival rate.
    #[clap(long, value_name = "FLOAT", default_value = "2.0")]
    lambda: f64,

    /// Service rate.
    #[clap(long, value_name = "FLOAT", default_value = "3.0")]
    mu: f64,

    /// Convergence threshold.
    #[clap(long, value_name = "FLOAT", default_value = "1e-10")]
    epsilon: f64,

    /// Also print the distribution at this time.
    #[clap(long, value_name = "FLOAT")]
    time: Option<f64>,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let args = Cli::parse();
    println!("args = {:?}", args);

    let dd = Mtbdd::default();
    let num_states = args.capacity + 1;
    let num_vars = (u64::BITS - args.capacity.max(1).leading_zeros()) as usize;
    let (rows, cols) = VarSet::interleaved(1, num_vars);

    // M/M/1/K queue
    let mut entries = vec![];
    for i in 0..num_states {
        if i < args.capacity {
            entries.push((i, i + 1, args.lambda));
        }
        if i > 0 {
            entries.push((i, i - 1, args.mu));
        }
    }
    let trans = dd.encode_matrix(&entries, &rows, &cols)?;
    let reach = dd.encode_vector(&vec![1.0; num_states as usize], &rows)?;
    let odd = Odd::build(&dd, reach, &rows)?;
    let mut start = vec![0.0; num_states as usize];
    start[0] = 1.0;
    let init = dd.encode_vector(&start, &rows)?;

    let config = SolverConfig {
        epsilon: args.epsilon,
        ..SolverConfig::default()
    };
    let solver = Solver::new(&dd, &config);
    let model = Model {
        trans,
        rows: &rows,
        cols: &cols,
        index: &odd,
    };

    let sol = solver.steady_state(&model, init, true)?;
    println!("report: {}", sol.report);

    // Closed form: π_i ∝ ρ^i
    let rho = args.lambda / args.mu;
    let norm: f64 = (0..num_states).map(|i| rho.powi(i as i32)).sum();
    let mut worst: f64 = 0.0;
    for (i, &p) in sol.values.iter().enumerate() {
        worst = worst.max((p - rho.powi(i as i32) / norm).abs());
    }
    println!("P(empty) = {:.8}, P(full) = {:.8}", sol.values[0], sol.values[num_states as usize - 1]);
    println!("max deviation from closed form: {:e}", worst);

    if let Some(t) = args.time {
        let transient = solver.transient_ctmc(&model, init, t)?;
        println!("report: {}", transient.report);
        println!("P(empty at t={}) = {:.8}", t, transient.values[0]);
    }

    Ok(())
}
