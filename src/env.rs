// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Reinforcement-learning environment boundary.
//
// The bridge only ever calls reset() and step(); the built-in CartPole
// keeps the gym-agent variant self-contained without a Python runtime.

use crate::error::{BridgeError, Result};

/// One step's outcome, gym-style.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub obs: [f32; 4],
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
}

impl StepOutcome {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

pub trait Environment: Send {
    fn name(&self) -> &str;
    fn reset(&mut self) -> [f32; 4];
    fn step(&mut self, action: u16) -> StepOutcome;
}

/// Construct an environment by gym-style name.
pub fn make_env(name: &str) -> Result<Box<dyn Environment>> {
    if name.starts_with("CartPole") {
        Ok(Box::new(CartPole::new(name)))
    } else {
        Err(BridgeError::Handler(format!("unknown environment '{name}'")))
    }
}

// ---------------------------------------------------------------------------
// CartPole (classic control dynamics, 500-step episode cap)
// ---------------------------------------------------------------------------

const GRAVITY: f32 = 9.8;
const MASS_CART: f32 = 1.0;
const MASS_POLE: f32 = 0.1;
const TOTAL_MASS: f32 = MASS_CART + MASS_POLE;
const HALF_POLE_LENGTH: f32 = 0.5;
const POLE_MASS_LENGTH: f32 = MASS_POLE * HALF_POLE_LENGTH;
const FORCE_MAG: f32 = 10.0;
const TAU: f32 = 0.02;
const X_THRESHOLD: f32 = 2.4;
const THETA_THRESHOLD: f32 = 12.0 * 2.0 * std::f32::consts::PI / 360.0;
const MAX_EPISODE_STEPS: u32 = 500;

pub struct CartPole {
    name: String,
    // state: x, x_dot, theta, theta_dot
    state: [f32; 4],
    steps: u32,
    rng: Lcg,
}

impl CartPole {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: [0.0; 4],
            steps: 0,
            rng: Lcg::new(0x5DEECE66D),
        }
    }
}

impl Environment for CartPole {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) -> [f32; 4] {
        for v in &mut self.state {
            *v = self.rng.uniform(-0.05, 0.05);
        }
        self.steps = 0;
        self.state
    }

    fn step(&mut self, action: u16) -> StepOutcome {
        let [x, x_dot, theta, theta_dot] = self.state;
        let force = if action != 0 { FORCE_MAG } else { -FORCE_MAG };

        let cos_theta = theta.cos();
        let sin_theta = theta.sin();
        let temp = (force + POLE_MASS_LENGTH * theta_dot * theta_dot * sin_theta) / TOTAL_MASS;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (HALF_POLE_LENGTH
                * (4.0 / 3.0 - MASS_POLE * cos_theta * cos_theta / TOTAL_MASS));
        let x_acc = temp - POLE_MASS_LENGTH * theta_acc * cos_theta / TOTAL_MASS;

        self.state = [
            x + TAU * x_dot,
            x_dot + TAU * x_acc,
            theta + TAU * theta_dot,
            theta_dot + TAU * theta_acc,
        ];
        self.steps += 1;

        let terminated = self.state[0].abs() > X_THRESHOLD || self.state[2].abs() > THETA_THRESHOLD;
        let truncated = !terminated && self.steps >= MAX_EPISODE_STEPS;

        StepOutcome {
            obs: self.state,
            reward: 1.0,
            terminated,
            truncated,
        }
    }
}

/// Small deterministic generator for reset jitter. Reproducible runs matter
/// more here than statistical quality.
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.state >> 33) as u32
    }

    fn uniform(&mut self, lo: f32, hi: f32) -> f32 {
        let unit = self.next_u32() as f32 / u32::MAX as f32;
        lo + unit * (hi - lo)
    }
}
