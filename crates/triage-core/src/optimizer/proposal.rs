//! Candidate generation: demonstration sampling and instruction variants

use rand::rngs::StdRng;
use rand::seq::index;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::dataset::{ExampleId, ExampleSet};
use crate::error::LeakError;
use crate::pipeline::{PipelineState, StageTrace};
use crate::signature::CLASSIFIER;
use crate::stage::Demonstration;

/// Successful pipeline traces of one training example
#[derive(Debug, Clone)]
pub struct BootstrapTrace {
    pub example_id: ExampleId,
    pub trace: Vec<StageTrace>,
}

/// Demonstrations available to the proposer, per stage.
///
/// Every entry is built from a training-pool example.
#[derive(Debug, Clone, Default)]
pub struct DemoPool {
    labeled: Vec<Demonstration>,
    bootstrapped: BTreeMap<String, Vec<Demonstration>>,
}

impl DemoPool {
    pub fn build(examples: &ExampleSet, traces: &[BootstrapTrace]) -> Result<Self, LeakError> {
        let mut labeled = Vec::new();
        for example in examples.training() {
            if let Some(demo) = examples.labeled_demonstration(&example.id)? {
                labeled.push(demo);
            }
        }

        let mut bootstrapped: BTreeMap<String, Vec<Demonstration>> = BTreeMap::new();
        for run in traces {
            for step in &run.trace {
                if examples
                    .demonstration_source(&run.example_id, &step.stage)?
                    .is_none()
                {
                    continue;
                }
                bootstrapped
                    .entry(step.stage.clone())
                    .or_default()
                    .push(Demonstration::new(
                        run.example_id.clone(),
                        step.input.clone(),
                        step.output.clone(),
                    ));
            }
        }

        Ok(Self {
            labeled,
            bootstrapped,
        })
    }

    pub fn labeled_count(&self) -> usize {
        self.labeled.len()
    }

    pub fn bootstrapped_count(&self, stage: &str) -> usize {
        self.bootstrapped.get(stage).map_or(0, Vec::len)
    }

    /// Draw a demonstration set for `stage`: bootstrapped traces first, then labeled pairs.
    ///
    /// Each draw is independent, so the same demonstration can reappear in later rounds.
    pub fn draw(
        &self,
        stage: &str,
        rng: &mut StdRng,
        max_labeled: usize,
        max_bootstrapped: usize,
    ) -> Vec<Demonstration> {
        let mut picked: Vec<Demonstration> = Vec::new();
        let mut used: HashSet<&ExampleId> = HashSet::new();

        if let Some(pool) = self.bootstrapped.get(stage) {
            let n = max_bootstrapped.min(pool.len());
            for i in index::sample(rng, pool.len(), n) {
                used.insert(&pool[i].example_id);
                picked.push(pool[i].clone());
            }
        }

        if stage == CLASSIFIER && max_labeled > 0 {
            let remaining: Vec<&Demonstration> = self
                .labeled
                .iter()
                .filter(|d| !used.contains(&d.example_id))
                .collect();
            let n = max_labeled.min(remaining.len());
            for i in index::sample(rng, remaining.len(), n) {
                picked.push(remaining[i].clone());
            }
        }

        picked
    }
}

/// What a round's candidates may change
#[derive(Debug, Clone)]
pub struct ProposalPlan<'a> {
    pub targets: &'a [String],
    pub budget: usize,
    pub demonstration_search: bool,
    pub max_labeled: usize,
    pub max_bootstrapped: usize,
    /// Rewritten instructions per stage, from instruction search
    pub rewrites: &'a HashMap<String, String>,
}

/// Clone `base` into `plan.budget` candidates.
///
/// With both strategies active, even-numbered candidates resample demonstrations
/// only, odd-numbered ones also take the rewritten instruction.
pub fn propose(
    base: &PipelineState,
    pool: &DemoPool,
    plan: &ProposalPlan<'_>,
    rng: &mut StdRng,
) -> Vec<PipelineState> {
    let mut candidates = Vec::with_capacity(plan.budget);
    for i in 0..plan.budget {
        let mut candidate = base.clone();
        for stage in plan.targets {
            // stages the base state lacks are left alone
            let Some(config) = candidate.get_mut(stage) else {
                continue;
            };

            if plan.demonstration_search {
                let drawn = pool.draw(stage, rng, plan.max_labeled, plan.max_bootstrapped);
                if !drawn.is_empty() {
                    config.demonstrations = drawn;
                }
            }
            if let Some(rewrite) = plan.rewrites.get(stage) {
                if !plan.demonstration_search || i % 2 == 1 {
                    config.instructions = rewrite.clone();
                }
            }
        }
        candidates.push(candidate);
    }
    candidates
}
