//! Interactive console for the stage simulator.
//!
//! Runs a tick loop at the configured interval and reads line commands from
//! stdin, so stages can be created, calibrated and driven by hand while the
//! simulation advances in the background.
//!
//! # Usage
//!
//! Start with the default configuration:
//! ```bash
//! stage-sim
//! ```
//!
//! Custom config file and 10x accelerated simulated time:
//! ```bash
//! stage-sim --config bench.toml --time-scale 10.0
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use nalgebra::{Point3, Vector3};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;

use stage_sim::config::SimConfig;
use stage_sim::logging;
use stage_sim::registry::StageModel;
use stage_sim::scheduler::MoveState;
use stage_sim::simulation::Simulation;
use stage_sim::transform::{Frame, Pairing};

#[derive(Parser)]
#[command(name = "stage-sim")]
#[command(about = "Virtual motorized stage simulator with chip calibration", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = stage_sim::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Simulated seconds per wall-clock second
    #[arg(long, default_value_t = 1.0)]
    time_scale: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SimConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    if !cli.time_scale.is_finite() || cli.time_scale <= 0.0 {
        return Err(anyhow!("--time-scale must be finite and positive"));
    }

    println!("🚀 stage-sim - Virtual Stage Simulator");
    println!("   Config: {}", cli.config.display());
    println!(
        "   Tick: {:?} at {}x simulated time",
        config.motion.tick_interval, cli.time_scale
    );
    println!();

    let sim = Simulation::new(&config)?;
    for info in sim.list_stages() {
        println!("   Stage '{}' ready ({} axes)", info.id, info.axes.len());
    }
    println!("Type 'help' for commands.");
    println!();

    run_console(sim, &config, cli.time_scale).await
}

async fn run_console(mut sim: Simulation, config: &SimConfig, time_scale: f64) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(config.motion.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let dt_s = config.motion.tick_interval.as_secs_f64() * time_scale;

    // Stages with a move in flight, so outcomes can be reported once.
    let mut in_flight: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sim.tick(dt_s)?;
                report_outcomes(&sim, &mut in_flight);
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if handle_line(&mut sim, &line, &mut in_flight) == Flow::Quit {
                            break;
                        }
                    }
                    // stdin closed
                    None => break,
                }
            }
        }
    }

    println!("👋 Shutting down...");
    Ok(())
}

/// Prints the outcome of every move that ended since the last tick.
fn report_outcomes(sim: &Simulation, in_flight: &mut HashSet<String>) {
    let ended: Vec<String> = in_flight
        .iter()
        .filter(|id| !matches!(sim.move_state(id), Ok(Some(state)) if !state.is_terminal()))
        .cloned()
        .collect();

    for id in ended {
        in_flight.remove(&id);
        match sim.move_state(&id) {
            Ok(Some(MoveState::Completed)) => {
                if let Ok(p) = sim.current_position(&id, Frame::Chip) {
                    println!(
                        "✅ {id} reached chip ({:.2}, {:.2}, {:.2}) at t={:.2}s",
                        p.x,
                        p.y,
                        p.z,
                        sim.sim_time_s()
                    );
                }
            }
            Ok(Some(MoveState::Faulted)) => {
                println!("❌ {id} faulted mid-move; run 'reset {id}' to clear");
            }
            Ok(Some(MoveState::Cancelled)) => {
                println!("🛑 {id} move cancelled");
            }
            _ => {}
        }
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Quit,
}

fn handle_line(sim: &mut Simulation, line: &str, in_flight: &mut HashSet<String>) -> Flow {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = tokens.first() else {
        return Flow::Continue;
    };
    if matches!(command, "quit" | "exit") {
        return Flow::Quit;
    }

    match execute(sim, &tokens, in_flight) {
        Ok(Some(message)) => println!("✅ {message}"),
        Ok(None) => {}
        Err(e) => println!("❌ {e:#}"),
    }
    Flow::Continue
}

fn execute(
    sim: &mut Simulation,
    tokens: &[&str],
    in_flight: &mut HashSet<String>,
) -> Result<Option<String>> {
    match tokens[0] {
        "help" => {
            print_help();
            Ok(None)
        }
        "stages" => {
            let infos = sim.list_stages();
            if infos.is_empty() {
                println!("   no stages registered");
            }
            for info in infos {
                println!(
                    "   {} axes={} status={} calibration={} pairings={}",
                    info.id,
                    info.axes.join(","),
                    info.status,
                    info.transform,
                    info.pairings
                );
            }
            Ok(None)
        }
        "create" => {
            let id = arg(tokens, 1, "id")?;
            let model: StageModel = arg(tokens, 2, "model")?.parse().map_err(|e: String| anyhow!(e))?;
            sim.create_stage_from_model(id, model)?;
            Ok(Some(format!("stage '{id}' created ({model})")))
        }
        "remove" => {
            let id = arg(tokens, 1, "id")?;
            if sim.remove_stage(id) {
                in_flight.remove(id);
                Ok(Some(format!("stage '{id}' removed")))
            } else {
                Ok(Some(format!("no stage '{id}'; nothing to do")))
            }
        }
        "pos" => {
            let id = arg(tokens, 1, "id")?;
            let native = sim.current_position(id, Frame::Native)?;
            let chip = sim.current_position(id, Frame::Chip)?;
            println!(
                "   native ({:.3}, {:.3}, {:.3}) um",
                native.x, native.y, native.z
            );
            println!("   chip   ({:.3}, {:.3}, {:.3}) um", chip.x, chip.y, chip.z);
            Ok(None)
        }
        "move" | "rel" => {
            let id = arg(tokens, 1, "id")?;
            let frame: Frame = arg(tokens, 2, "frame")?.parse().map_err(|e: String| anyhow!(e))?;
            let x = float_arg(tokens, 3, "x")?;
            let y = float_arg(tokens, 4, "y")?;
            let z = float_arg(tokens, 5, "z")?;
            let speed = tokens
                .get(6)
                .map(|s| {
                    s.parse::<f64>()
                        .with_context(|| format!("invalid speed '{s}'"))
                })
                .transpose()?;

            if tokens[0] == "move" {
                sim.move_to(id, Point3::new(x, y, z), frame, speed)?;
            } else {
                sim.move_relative(id, Vector3::new(x, y, z), frame, speed)?;
            }
            in_flight.insert(id.to_string());
            Ok(Some(format!("{id} moving ({frame} frame)")))
        }
        "pair" => {
            let id = arg(tokens, 1, "id")?;
            let cx = float_arg(tokens, 2, "chip_x")?;
            let cy = float_arg(tokens, 3, "chip_y")?;
            let cz = float_arg(tokens, 4, "chip_z")?;

            let stage_pos = sim.current_position(id, Frame::Native)?;
            let pairing = Pairing::new(stage_pos, Point3::new(cx, cy, cz));
            match sim.add_calibration_pairing(id, pairing)? {
                Some(report) => Ok(Some(format!(
                    "pairing recorded; affine fit rms {:.3} um over {} pairings",
                    report.rms_um,
                    report.residuals_um.len()
                ))),
                None => Ok(Some("pairing recorded".to_string())),
            }
        }
        "cancel" => {
            let id = arg(tokens, 1, "id")?;
            if sim.cancel(id)? {
                Ok(Some(format!("cancel requested for '{id}'")))
            } else {
                Ok(Some(format!("no move in flight on '{id}'")))
            }
        }
        "reset" => {
            let id = arg(tokens, 1, "id")?;
            sim.reset(id)?;
            Ok(Some(format!("'{id}' is idle")))
        }
        "save" => {
            let id = arg(tokens, 1, "id")?;
            let path = arg(tokens, 2, "path")?;
            sim.save_calibration(id, path)?;
            Ok(Some(format!("calibration of '{id}' saved to {path}")))
        }
        "load" => {
            let id = arg(tokens, 1, "id")?;
            let path = arg(tokens, 2, "path")?;
            sim.load_calibration(id, path)?;
            Ok(Some(format!("calibration of '{id}' loaded from {path}")))
        }
        "time" => {
            println!("   t = {:.2} s simulated", sim.sim_time_s());
            Ok(None)
        }
        other => Err(anyhow!("unknown command '{other}' (try 'help')")),
    }
}

fn arg<'a>(tokens: &[&'a str], index: usize, name: &str) -> Result<&'a str> {
    tokens
        .get(index)
        .copied()
        .ok_or_else(|| anyhow!("missing argument <{name}>"))
}

fn float_arg(tokens: &[&str], index: usize, name: &str) -> Result<f64> {
    arg(tokens, index, name)?
        .parse()
        .with_context(|| format!("invalid number for <{name}>"))
}

fn print_help() {
    println!("Commands:");
    println!("  stages                                   list stages");
    println!("  create <id> <model>                      create a stage");
    println!("                                           (fiber_positioner, planar_xy, linear_rail)");
    println!("  remove <id>                              remove a stage");
    println!("  pos <id>                                 show native and chip position");
    println!("  move <id> <frame> <x> <y> <z> [speed]    absolute move (frame: native|chip)");
    println!("  rel <id> <frame> <dx> <dy> <dz> [speed]  relative move");
    println!("  pair <id> <cx> <cy> <cz>                 pair current position with chip coords");
    println!("  cancel <id>                              cancel the move in flight");
    println!("  reset <id>                               clear a latched fault");
    println!("  save <id> <path>                         save calibration to JSON");
    println!("  load <id> <path>                         load calibration from JSON");
    println!("  time                                     show simulated time");
    println!("  quit                                     exit");
}
