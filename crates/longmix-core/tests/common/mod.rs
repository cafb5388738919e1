#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use longmix_bridge::{
    BridgeError, CallLimits, EngineCoefficient, EngineOutput, EngineSession, EngineVarComp,
    FitRequest, FittingEngine, Payload,
};
use longmix_model::{
    Family, ImputedDataset, LadderState, ModelSpec, Observation, OutcomeSpec, Treatment,
};

pub type Script = dyn Fn(&FitRequest, usize) -> Result<EngineOutput, BridgeError> + Send + Sync;

/// Engine whose replies come from a closure of (request, imputation).
#[derive(Clone)]
pub struct ScriptedEngine {
    script: Arc<Script>,
    pub calls: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(
        script: impl Fn(&FitRequest, usize) -> Result<EngineOutput, BridgeError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always converges.
    pub fn converging() -> Self {
        Self::new(|request, _| Ok(converged(request)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct ScriptedSession {
    engine: ScriptedEngine,
}

impl FittingEngine for ScriptedEngine {
    type Session = ScriptedSession;

    fn name(&self) -> &str {
        "scripted"
    }

    fn open_session(&self) -> longmix_bridge::Result<ScriptedSession> {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(ScriptedSession {
            engine: self.clone(),
        })
    }
}

impl EngineSession for ScriptedSession {
    fn execute(
        &mut self,
        payload: &Payload,
        _limits: &CallLimits,
    ) -> longmix_bridge::Result<EngineOutput> {
        self.engine.calls.fetch_add(1, Ordering::SeqCst);
        let request = &payload.request;
        (self.engine.script)(request, imputation_of(request))
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.engine.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Test datasets put the imputation index in the first response value.
pub fn imputation_of(request: &FitRequest) -> usize {
    request.numeric[&request.response][0].round() as usize
}

/// A converged fit whose intercept is the response mean.
pub fn converged(request: &FitRequest) -> EngineOutput {
    let values = &request.numeric[&request.response];
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let random_effects = if request.random {
        vec![EngineVarComp {
            group: "participant_id".into(),
            term: "(Intercept)".into(),
            variance: 0.6,
        }]
    } else {
        Vec::new()
    };
    EngineOutput {
        engine_version: "scripted 1.0".into(),
        converged: true,
        coefficients: vec![
            EngineCoefficient {
                name: "(Intercept)".into(),
                estimate: Some(mean),
                std_error: Some(0.2),
            },
            EngineCoefficient {
                name: "time".into(),
                estimate: Some(0.5),
                std_error: Some(0.05),
            },
        ],
        vcov_names: vec!["(Intercept)".into(), "time".into()],
        vcov: vec![vec![Some(0.04), Some(0.0)], vec![Some(0.0), Some(0.0025)]],
        random_effects,
        residual_variance: Some(0.5),
        log_likelihood: Some(-40.0),
        df_residual: Some(request.n_rows as f64 - 2.0),
        n_obs: Some(request.n_rows),
        ..EngineOutput::default()
    }
}

pub fn state_of(request: &FitRequest) -> LadderState {
    request.ladder_state
}

/// Eight participants in two replicates, three visits each. The first
/// response value equals `index`; rows of participant P7 are flagged as
/// outliers and sit far above the rest.
pub fn dataset(index: usize) -> ImputedDataset {
    let mut rows = Vec::new();
    for p in 0..8u32 {
        let treatment = if p % 2 == 0 { Treatment::A } else { Treatment::B };
        for time in 0..3u32 {
            let value = if p == 0 && time == 0 {
                index as f64
            } else if p == 7 {
                50.0
            } else {
                index as f64 + f64::from(p) * 0.1 + f64::from(time) * 0.5
            };
            rows.push(Observation {
                replicate_id: format!("R{}", p / 4),
                participant_id: format!("P{p}"),
                treatment,
                time,
                baseline: Some(1.0),
                outcome_value: Some(value),
                is_outlier: p == 7,
            });
        }
    }
    ImputedDataset::from_observations(index, "crp", &rows).unwrap()
}

pub fn imputations(m: usize) -> Vec<ImputedDataset> {
    (1..=m).map(dataset).collect()
}

pub fn outcome() -> OutcomeSpec {
    OutcomeSpec::new(
        ModelSpec::parse(
            "crp ~ treatment * time + (1 + time | participant_id)",
            Family::Gaussian,
            None,
        )
        .unwrap(),
    )
}
