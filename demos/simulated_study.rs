use std::sync::Arc;

use allotment::{
    run_study, Engine, EngineConfig, MemoryStore, RecordingRecruitment, SimulatedArm, Simulation,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), allotment::EngineError> {
    // `RUST_LOG=allotment=debug` shows every assignment and advance.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("allotment=info")),
        )
        .init();

    // Environment overrides (N_SIM, BATCH_SIZE, WARMUP_N, ...) on top of demo defaults.
    let mut config = EngineConfig::from_env()?;
    if std::env::var("STOPPAGE_THRESHOLD").is_err() {
        config.stoppage_threshold = Some(0.95);
    }
    if std::env::var("BATCH_SIZE").is_err() {
        config.batch_capacity = 10;
    }
    if std::env::var("N_SIM").is_err() {
        config.n_sim = 20_000;
    }
    config.validate()?;

    let recruitment = Arc::new(RecordingRecruitment::new());
    let engine = Engine::new(config, Arc::new(MemoryStore::new()), recruitment.clone())?;

    let sim = Simulation {
        threads: 4,
        garbage_rate: 0.05,
        duplicate_rate: 0.02,
        seed: 2024,
        ..Simulation::new(
            vec![
                SimulatedArm::new("control", 0.30),
                SimulatedArm::new("reminder", 0.34),
                SimulatedArm::new("incentive", 0.45),
            ],
            2_000,
        )
    };
    let report = run_study(&engine, &sim)?;

    eprintln!(
        "participants={} batches={} stopped_early={}",
        report.participants, report.batches, report.stopped_early
    );
    eprintln!(
        "charged={} warmup={} garbage={} duplicates={} redirected={}",
        report.charged, report.warmup, report.garbage, report.duplicates, report.redirected
    );
    for (arm, p) in sim.arms.iter().zip(&report.final_win_probabilities) {
        eprintln!(
            "{:<10} true={:.2} assigned={:>5} ({:.1}%) P(best)={:.3}",
            arm.label,
            arm.success_rate,
            report.assignments.get(&arm.label).copied().unwrap_or(0),
            100.0 * report.allocation_share(&arm.label),
            p
        );
    }
    for h in &report.halts {
        eprintln!("halt {:?}: {} (acknowledged={})", h.kind, h.detail, h.acknowledged);
    }
    eprintln!("pause requests honoured: {}", recruitment.pauses());
    Ok(())
}
