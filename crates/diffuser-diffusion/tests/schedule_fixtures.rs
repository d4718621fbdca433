//! Integration tests using JSON fixtures of the cosine schedule.
//!
//! Reference values were computed in double precision and rounded to f32.

use diffuser_diffusion::Schedule;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// Tolerance for floating point comparisons
const EPSILON: f32 = 1e-5;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn assert_approx_eq(expected: f32, actual: f32, name: &str) {
    let diff = (expected - actual).abs();
    assert!(
        diff < EPSILON,
        "{}: expected {}, got {} (diff: {})",
        name,
        expected,
        actual,
        diff
    );
}

#[derive(Debug, Deserialize)]
struct ScheduleFixtures {
    schedules: Vec<ScheduleFixture>,
}

#[derive(Debug, Deserialize)]
struct ScheduleFixture {
    num_steps: usize,
    s: f64,
    betas: Vec<f32>,
    alphas_cumprod: Vec<f32>,
}

fn load_fixtures() -> ScheduleFixtures {
    let fixture_path = fixtures_dir().join("cosine_schedule.json");
    let content = fs::read_to_string(&fixture_path).expect("Failed to read fixture");
    serde_json::from_str(&content).expect("Failed to parse fixture")
}

#[test]
fn test_cosine_betas_match_reference() {
    for fixture in load_fixtures().schedules {
        let schedule = Schedule::cosine(fixture.num_steps, fixture.s).unwrap();
        assert_eq!(schedule.betas.len(), fixture.betas.len(), "Length mismatch");

        for (i, (expected, actual)) in fixture.betas.iter().zip(&schedule.betas).enumerate() {
            assert_approx_eq(
                *expected,
                *actual,
                &format!("betas[{}] (n={}, s={})", i, fixture.num_steps, fixture.s),
            );
        }
    }
}

#[test]
fn test_alphas_cumprod_match_reference() {
    for fixture in load_fixtures().schedules {
        let schedule = Schedule::cosine(fixture.num_steps, fixture.s).unwrap();

        for (i, (expected, actual)) in fixture
            .alphas_cumprod
            .iter()
            .zip(&schedule.alphas_cumprod)
            .enumerate()
        {
            assert_approx_eq(
                *expected,
                *actual,
                &format!("alphas_cumprod[{}] (n={}, s={})", i, fixture.num_steps, fixture.s),
            );
        }
    }
}

#[test]
fn test_last_beta_is_clipped() {
    for fixture in load_fixtures().schedules {
        let schedule = Schedule::cosine(fixture.num_steps, fixture.s).unwrap();
        assert_eq!(*schedule.betas.last().unwrap(), 0.999);
    }
}

#[test]
fn test_posterior_coefficients_consistent() {
    // q(x_{t-1} | x_t, x_0) must reproduce x_0 exactly when x_t is the
    // noiseless forward sample of x_0 at the previous step's level
    let schedule = Schedule::cosine(10, 0.008).unwrap();
    for t in 1..10 {
        let x0 = 1.0f32;
        let x_t = schedule.sqrt_alphas_cumprod[t] * x0;
        let mean = schedule.posterior_mean_coef1[t] * x0 + schedule.posterior_mean_coef2[t] * x_t;
        let expected = schedule.alphas_cumprod_prev[t].sqrt() * x0;
        assert_approx_eq(expected, mean, &format!("posterior mean at t={}", t));
    }
}
