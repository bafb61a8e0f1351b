//! Fuzz target for snapshot application.
//!
//! Whatever a decoded snapshot contains, applying it either succeeds or is rejected with
//! an error. A rejected snapshot must leave the runner's digest unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;

use lockstep_sync::network::codec;
use lockstep_sync::observation::{AgentValues, EnvReset, EnvStep, RawObservation, Tensor};
use lockstep_sync::{
    Config, DeterministicEnvironmentRunner, Environment, EnvironmentError, FullSnapshot, Info,
    JointAction, Pcg32, PeerId,
};

struct FuzzConfig;

impl Config for FuzzConfig {
    type Action = u8;
    type EnvState = u32;
    type Render = u32;
}

struct Ticker(u32);

impl Environment<FuzzConfig> for Ticker {
    fn reset(&mut self, _seed: u64, _rng: &mut Pcg32) -> Result<EnvReset, EnvironmentError> {
        self.0 = 0;
        Ok(EnvReset {
            observation: RawObservation::Single(Tensor::scalar(0.0)),
            info: Info::new(),
        })
    }

    fn step(
        &mut self,
        _joint_action: &JointAction<u8>,
        _rng: &mut Pcg32,
    ) -> Result<EnvStep, EnvironmentError> {
        self.0 = self.0.wrapping_add(1);
        Ok(EnvStep {
            observation: RawObservation::Single(Tensor::scalar(f64::from(self.0))),
            rewards: AgentValues::Single(1.0),
            terminated: AgentValues::Single(false),
            truncated: AgentValues::Single(false),
            info: Info::new(),
        })
    }

    fn render(&self) -> u32 {
        self.0
    }

    fn save_state(&self) -> Result<u32, EnvironmentError> {
        Ok(self.0)
    }

    fn load_state(&mut self, state: &u32) -> Result<(), EnvironmentError> {
        self.0 = *state;
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let Ok(snapshot) = codec::decode_value::<FullSnapshot<u32>>(data) else {
        return;
    };
    let mut runner = DeterministicEnvironmentRunner::<FuzzConfig>::new(
        Box::new(Ticker(0)),
        [PeerId::from("fuzz")],
        4,
    );
    if runner.reset(1).is_err() {
        return;
    }
    let Ok(before) = runner.digest() else {
        return;
    };
    if runner.apply_snapshot(&snapshot).is_err() {
        assert_eq!(runner.digest().ok(), Some(before));
    }
});
