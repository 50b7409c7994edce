// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralEM — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Synthetic study tooling: generate images and flight paths, forward-model
//! a section into observations/residuals, and inspect saved tree models.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use se_chain::{ChainConfig, ChainState, System};
use se_cli::{basis_from_id, fail, init_tracing, load_systems};
use se_core::comms::Comm;
use se_core::constants::DEFAULT_CONDUCTIVITY;
use se_core::error::{CoreError, CoreResult};
use se_core::forward::Geometry;
use se_core::image::ConductivitySection;
use se_core::observations::{Direction, Observations, Point, Response};
use se_core::prior::PriorProposal;
use se_wavetree::WaveTree;

#[derive(Parser)]
#[command(author, version, about = "Synthetic studies and model inspection")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a synthetic conductivity section
    SynthImage(SynthImageArgs),
    /// Write a synthetic flight path (geometry only)
    SynthFlightpath(SynthFlightpathArgs),
    /// Forward-model a section against observations
    Residuals(ResidualsArgs),
    /// Likelihood of a saved tree model
    Likelihood(LikelihoodArgs),
    /// Structure report of a saved tree model
    Analyse(AnalyseArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ImageModel {
    /// Uniform background
    Constant,
    /// A conductive slab in the background half
    Slab,
    /// Alternating conductive blocks at two depths
    Blocks,
}

#[derive(clap::Args)]
struct SynthImageArgs {
    /// Lateral samples (power of 2)
    #[arg(short = 'W', long = "horizontal-samples", default_value_t = 1024)]
    horizontal_samples: usize,

    /// Depth samples (power of 2)
    #[arg(short = 'H', long = "depth-samples", default_value_t = 32)]
    depth_samples: usize,

    /// Depth to half-space (m)
    #[arg(short = 'D', long, default_value_t = 500.0)]
    depth: f64,

    /// Image family
    #[arg(short = 'm', long, value_enum, default_value_t = ImageModel::Slab)]
    model: ImageModel,

    /// Output section (with header)
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Also write the bare grid
    #[arg(short = 'O', long = "output-image")]
    output_image: Option<PathBuf>,

    #[arg(short = 'b', long = "background-conductivity", default_value_t = DEFAULT_CONDUCTIVITY)]
    background_conductivity: f64,

    #[arg(short = 'c', long, default_value_t = 1.0)]
    conductivity: f64,
}

#[derive(clap::Args)]
struct SynthFlightpathArgs {
    /// Number of soundings (power of 2)
    #[arg(short = 'N', long, default_value_t = 1024)]
    nsamples: usize,

    #[arg(short = 'e', long = "height-mean", default_value_t = 100.0)]
    height_mean: f64,
    #[arg(short = 'E', long = "height-std", default_value_t = 5.0)]
    height_std: f64,

    #[arg(short = 'p', long = "pitch-mean", default_value_t = 0.0)]
    pitch_mean: f64,
    #[arg(short = 'P', long = "pitch-std", default_value_t = 1.0)]
    pitch_std: f64,

    #[arg(short = 'r', long = "roll-mean", default_value_t = 0.0)]
    roll_mean: f64,
    #[arg(short = 'R', long = "roll-std", default_value_t = 2.0)]
    roll_std: f64,

    #[arg(short = 'x', long = "dx-mean", default_value_t = -12.5)]
    dx_mean: f64,
    #[arg(short = 'X', long = "dx-std", default_value_t = 0.5)]
    dx_std: f64,

    #[arg(short = 'z', long = "dz-mean", default_value_t = 2.0)]
    dz_mean: f64,
    #[arg(short = 'Z', long = "dz-std", default_value_t = 0.2)]
    dz_std: f64,

    #[arg(short = 'S', long, default_value_t = 983)]
    seed: u64,

    /// Output observations file (zero responses)
    #[arg(short = 'o', long)]
    output: PathBuf,
}

#[derive(clap::Args)]
struct ResidualsArgs {
    /// Input observations (geometry, and data when differencing)
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Input conductivity section
    #[arg(short = 'I', long)]
    image: PathBuf,

    /// Forward model descriptor (repeat once per system)
    #[arg(short = 's', long)]
    stm: Vec<PathBuf>,

    /// Noise model file (one per stm; enables noisy synthetic output)
    #[arg(short = 'H', long)]
    hierarchical: Vec<PathBuf>,

    /// Write per-sample residuals here
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Write forward responses here
    #[arg(short = 'r', long)]
    response: Option<PathBuf>,

    /// Write a synthetic observations file with the modelled responses
    #[arg(short = 'O', long = "observations-out")]
    observations_out: Option<PathBuf>,

    /// Seed for the additive noise in the synthetic observations
    #[arg(short = 'S', long = "noise-seed")]
    noise_seed: Option<u64>,
}

#[derive(clap::Args)]
struct LikelihoodArgs {
    /// Saved tree model
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Observations file
    #[arg(short = 'o', long)]
    observations: PathBuf,

    /// Forward model descriptor (repeat once per system)
    #[arg(short = 's', long)]
    stm: Vec<PathBuf>,

    /// Noise model file (one per stm file)
    #[arg(short = 'H', long)]
    hierarchical: Vec<PathBuf>,

    #[arg(short = 'd', long = "degree-depth", default_value_t = 5)]
    degree_depth: u32,

    #[arg(short = 'l', long = "degree-lateral", default_value_t = 10)]
    degree_lateral: u32,

    #[arg(short = 'D', long, default_value_t = 500.0)]
    depth: f64,

    #[arg(short = 'w', long = "wavelet-vertical", default_value_t = 0)]
    wavelet_vertical: u32,

    #[arg(short = 'W', long = "wavelet-horizontal", default_value_t = 0)]
    wavelet_horizontal: u32,

    /// Noise scale to evaluate at
    #[arg(short = 'L', long, default_value_t = 1.0)]
    lambda: f64,
}

#[derive(clap::Args)]
struct AnalyseArgs {
    /// Saved tree model
    #[arg(short = 'i', long)]
    input: PathBuf,

    #[arg(short = 'd', long = "degree-depth", default_value_t = 5)]
    degree_depth: u32,

    #[arg(short = 'l', long = "degree-lateral", default_value_t = 10)]
    degree_lateral: u32,
}

fn is_power_of_two(v: usize) -> bool {
    v >= 2 && v & (v - 1) == 0
}

fn run_synth_image(args: SynthImageArgs) -> CoreResult<()> {
    if !is_power_of_two(args.horizontal_samples) || !is_power_of_two(args.depth_samples) {
        return Err(CoreError::Validation(
            "sample counts must be powers of two".into(),
        ));
    }
    let rows = args.depth_samples;
    let columns = args.horizontal_samples;
    let mut section =
        ConductivitySection::filled(rows, columns, args.depth, args.background_conductivity)?;

    match args.model {
        ImageModel::Constant => {}
        ImageModel::Slab => {
            // A conductive slab across the central third, upper half.
            for row in rows / 4..rows / 2 {
                for col in columns / 3..2 * columns / 3 {
                    section.set(row, col, args.conductivity);
                }
            }
        }
        ImageModel::Blocks => {
            for (bi, col_range) in [
                (0usize, columns / 8..3 * columns / 8),
                (1, 5 * columns / 8..7 * columns / 8),
            ] {
                let (lo, hi) = if bi == 0 {
                    (rows / 8, 3 * rows / 8)
                } else {
                    (rows / 2, 3 * rows / 4)
                };
                for row in lo..hi {
                    for col in col_range.clone() {
                        section.set(row, col, args.conductivity);
                    }
                }
            }
        }
    }

    section.save(&args.output)?;
    if let Some(path) = &args.output_image {
        section.save_grid(path)?;
    }
    println!("{} x {} section written", columns, rows);
    Ok(())
}

fn run_synth_flightpath(args: SynthFlightpathArgs) -> CoreResult<()> {
    if !is_power_of_two(args.nsamples) {
        return Err(CoreError::Validation(
            "sample count must be a power of two".into(),
        ));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);

    // Mean-reverting random walks keep the geometry near nominal while
    // wandering like a real tow assembly.
    let walk = |mean: f64, std: f64| -> Box<dyn FnMut(&mut ChaCha8Rng) -> f64> {
        let mut x = mean;
        Box::new(move |rng| {
            let step = Normal::new(0.0, std / 10.0).expect("positive std").sample(rng);
            x += step + (mean - x) / 20.0;
            x
        })
    };
    let mut height = walk(args.height_mean, args.height_std);
    let mut roll = walk(args.roll_mean, args.roll_std);
    let mut pitch = walk(args.pitch_mean, args.pitch_std);
    let mut dx = walk(args.dx_mean, args.dx_std);
    let mut dz = walk(args.dz_mean, args.dz_std);

    let mut obs = Observations::default();
    for _ in 0..args.nsamples {
        obs.points.push(Point {
            tx_height: height(&mut rng),
            tx_roll: roll(&mut rng),
            tx_pitch: pitch(&mut rng),
            tx_yaw: 0.0,
            txrx_dx: dx(&mut rng),
            txrx_dy: 0.0,
            txrx_dz: dz(&mut rng),
            rx_roll: 0.0,
            rx_pitch: 0.0,
            rx_yaw: 0.0,
            responses: Vec::new(),
        });
    }
    obs.save(&args.output)?;
    println!("{} soundings written", args.nsamples);
    Ok(())
}

fn run_residuals(args: ResidualsArgs) -> CoreResult<()> {
    let obs = Observations::read(&args.input)?;
    let section = ConductivitySection::load(&args.image)?;
    if obs.points.len() != section.columns {
        return Err(CoreError::Validation(format!(
            "{} soundings but {} image columns",
            obs.points.len(),
            section.columns
        )));
    }
    // Noise files are optional here; without them the synthetic output is
    // noise-free.
    let (forwards, noises) = if args.hierarchical.is_empty() {
        if args.stm.is_empty() {
            return Err(CoreError::Validation(
                "at least one forward-model descriptor is required".into(),
            ));
        }
        let mut forwards: Vec<Arc<dyn se_core::forward::ForwardModel>> = Vec::new();
        for path in &args.stm {
            let stm = se_core::stm::StmDescriptor::load(path)?;
            forwards.push(Arc::new(
                se_core::forward::HalfspaceConvolution::from_descriptor(&stm)?,
            ));
        }
        (forwards, Vec::new())
    } else {
        load_systems(&args.stm, &args.hierarchical)?
    };

    let mut rng = args.noise_seed.map(ChaCha8Rng::seed_from_u64);

    let mut residual_out: Option<std::io::BufWriter<std::fs::File>> = match &args.output {
        Some(p) => Some(std::io::BufWriter::new(
            std::fs::File::create(p).map_err(|e| CoreError::io(p, e))?,
        )),
        None => None,
    };
    let mut response_out: Option<std::io::BufWriter<std::fs::File>> = match &args.response {
        Some(p) => Some(std::io::BufWriter::new(
            std::fs::File::create(p).map_err(|e| CoreError::io(p, e))?,
        )),
        None => None,
    };

    let mut synthetic = Observations::default();
    let mut profile = vec![0.0; section.rows];
    for (c, point) in obs.points.iter().enumerate() {
        let geometry = Geometry::from(point);
        section.column_profile(c, false, &mut profile);
        let mut out_point = point.clone();
        out_point.responses.clear();

        for (si, forward) in forwards.iter().enumerate() {
            let mut predicted = vec![0.0; forward.window_count()];
            forward.eval(
                &geometry,
                &profile,
                &section.layer_thickness,
                &mut predicted,
            );

            if let (Some(noise), Some(rng)) = (noises.get(si), rng.as_mut()) {
                for (w, p) in predicted.iter_mut().enumerate() {
                    let t = forward.centre_times()[w];
                    let sigma = noise.noise_magnitude(*p, t, 1.0);
                    *p += Normal::new(0.0, sigma)
                        .map_err(|_| CoreError::Numeric {
                            context: "synthetic noise magnitude",
                        })?
                        .sample(rng);
                }
            }

            if let Some(out) = response_out.as_mut() {
                for p in &predicted {
                    write!(out, "{p:.9e} ").map_err(|e| CoreError::io("<response>", e))?;
                }
                writeln!(out).map_err(|e| CoreError::io("<response>", e))?;
            }
            if let Some(out) = residual_out.as_mut() {
                if let Some(observed) = point.responses.get(si) {
                    for (o, p) in observed.values.iter().zip(&predicted) {
                        write!(out, "{:.9e} ", o - p).map_err(|e| CoreError::io("<residuals>", e))?;
                    }
                    writeln!(out).map_err(|e| CoreError::io("<residuals>", e))?;
                }
            }
            out_point.responses.push(Response {
                direction: Direction::Z,
                values: predicted,
            });
        }
        synthetic.points.push(out_point);
    }

    if let Some(path) = &args.observations_out {
        synthetic.save(path)?;
        println!("synthetic observations written to {}", path.display());
    }
    Ok(())
}

fn run_likelihood(args: LikelihoodArgs) -> CoreResult<()> {
    let observations = Arc::new(Observations::read(&args.observations)?);
    let (forwards, noises) = load_systems(&args.stm, &args.hierarchical)?;
    let systems: Vec<System> = forwards
        .into_iter()
        .zip(noises)
        .map(|(f, n)| System::new(f, n))
        .collect();

    let mut config = ChainConfig::new(args.degree_lateral, args.degree_depth, args.depth);
    config.hbasis = basis_from_id(args.wavelet_horizontal, "horizontal")?;
    config.vbasis = basis_from_id(args.wavelet_vertical, "vertical")?;
    config.initial_model = Some(args.input.clone());

    let mut state = ChainState::new(
        &config,
        observations,
        systems,
        PriorProposal::default_for_depth(args.degree_lateral.max(args.degree_depth)),
        Comm::Solo,
        1.0,
    )?;
    state.lambda_scale = args.lambda;
    let (like, log_norm) = state.likelihood()?;
    println!("Likelihood: {like:.9} ({log_norm:.9})");
    Ok(())
}

fn run_analyse(args: AnalyseArgs) -> CoreResult<()> {
    let mut tree = WaveTree::new(args.degree_lateral, args.degree_depth)?;
    tree.load(&args.input)?;

    println!("{} x {} grid", tree.width(), tree.height());
    println!("{} coefficients, max depth {}", tree.coefficient_count(), tree.max_depth());

    let levels = tree.max_depth() as usize + 1;
    let mut count = vec![0usize; levels];
    let mut vmin = vec![f64::INFINITY; levels];
    let mut vmax = vec![f64::NEG_INFINITY; levels];
    for (idx, value) in tree.live_snapshot() {
        let d = tree.depth_of(idx) as usize;
        count[d] += 1;
        vmin[d] = vmin[d].min(value);
        vmax[d] = vmax[d].max(value);
    }
    for d in 0..levels {
        if count[d] == 0 {
            println!("depth {d}: empty");
        } else {
            println!(
                "depth {d}: {} coefficients in [{:.6}, {:.6}]",
                count[d], vmin[d], vmax[d]
            );
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let _ = init_tracing();
    let result = match cli.command {
        Command::SynthImage(args) => run_synth_image(args),
        Command::SynthFlightpath(args) => run_synth_flightpath(args),
        Command::Residuals(args) => run_residuals(args),
        Command::Likelihood(args) => run_likelihood(args),
        Command::Analyse(args) => run_analyse(args),
    };
    if let Err(err) = result {
        fail(err);
    }
}
