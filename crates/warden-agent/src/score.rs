//! Composite 0-100 health score. Liveness dominates; latency, resource use, hub registration
//! and endpoint coverage refine it.

use warden_process::HealthState;

const LIVENESS_WEIGHT: f64 = 40.0;
const LATENCY_WEIGHT: f64 = 20.0;
const RESOURCE_WEIGHT: f64 = 15.0;
const REGISTRATION_WEIGHT: f64 = 10.0;
const COVERAGE_WEIGHT: f64 = 15.0;

const HIGH_CPU_PERCENT: f64 = 90.0;
const HIGH_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ScoreInputs {
    pub state: HealthState,
    pub response_time_ms: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
    /// `None` when no hub is configured or reachable.
    pub registered: Option<bool>,
    pub endpoints_ok: usize,
    pub endpoints_total: usize,
}

fn liveness(state: HealthState) -> f64 {
    match state {
        HealthState::Healthy => 1.0,
        HealthState::Starting => 0.5,
        HealthState::Unhealthy => 0.25,
        HealthState::Unknown
        | HealthState::NotRunning
        | HealthState::Timeout
        | HealthState::Error => 0.0,
    }
}

fn latency(response_time_ms: Option<u64>) -> f64 {
    match response_time_ms {
        None => 0.0,
        Some(ms) if ms < 100 => 1.0,
        Some(ms) if ms < 500 => 0.75,
        Some(ms) if ms < 1000 => 0.5,
        Some(ms) if ms < 3000 => 0.25,
        Some(_) => 0.0,
    }
}

fn resources(cpu_percent: Option<f64>, memory_bytes: Option<u64>) -> f64 {
    let cpu = cpu_percent.filter(|c| c.is_finite());
    if cpu.is_none() && memory_bytes.is_none() {
        // Unknown usage is neither rewarded nor punished.
        return 0.5;
    }
    let mut part = 1.0;
    if cpu.is_some_and(|c| c > HIGH_CPU_PERCENT) {
        part -= 0.5;
    }
    if memory_bytes.is_some_and(|m| m > HIGH_MEMORY_BYTES) {
        part -= 0.5;
    }
    part
}

fn registration(registered: Option<bool>) -> f64 {
    match registered {
        Some(true) => 1.0,
        Some(false) => 0.0,
        None => 0.5,
    }
}

fn coverage(ok: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (ok.min(total) as f64) / (total as f64)
}

pub fn health_score(inputs: &ScoreInputs) -> u8 {
    let alive = liveness(inputs.state);
    let mut score = LIVENESS_WEIGHT * alive;
    // Latency and resources only count for something that answers.
    if alive > 0.0 {
        score += LATENCY_WEIGHT * latency(inputs.response_time_ms);
        score += RESOURCE_WEIGHT * resources(inputs.cpu_percent, inputs.memory_bytes);
    }
    score += REGISTRATION_WEIGHT * registration(inputs.registered);
    score += COVERAGE_WEIGHT * coverage(inputs.endpoints_ok, inputs.endpoints_total);

    if !score.is_finite() {
        return 0;
    }
    score.round().clamp(0.0, 100.0) as u8
}
