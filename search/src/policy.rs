//! The sketch search policy.
//!
//! A two-phase enumerator drives the search: rule-directed sketch
//! generation fixes the high-level structure (tiling shape, fusion,
//! caching), randomized init rules fill in the decorations (tile sizes,
//! compute locations, annotations). An outer loop interleaves cost-model
//! guided selection, epsilon-greedy exploration, measurement and cost-model
//! retraining until the trial budget or early stopping ends the search.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use zorya_dag::{ComputeAt, State, TransformStep};

use crate::config::{SearchParams, SearchTask};
use crate::cost_model::CostModel;
use crate::error::{NoSketchesSnafu, Result};
use crate::measure::{MeasureInput, MeasureResult, Measurer};
use crate::rules::init::{InitContext, InitResultKind, InitRule, default_init_rules, enumerate_attach_candidates};
use crate::rules::sketch::{ConditionKind, SketchContext, SketchRule, default_sketch_rules};
use crate::rules::util::{get_single_consumer_id, needs_multi_level_tiling};
use crate::split_memo::SplitFactorizationMemo;

/// Hook run once at policy construction (e.g. preloading measured states
/// from an earlier session).
pub trait SearchCallback {
    fn apply(&self, policy: &mut SketchSearchPolicy) -> Result<()>;
}

/// Sketch-based schedule search over one task.
pub struct SketchSearchPolicy {
    task: SearchTask,
    params: SearchParams,
    cost_model: Box<dyn CostModel>,
    rng: StdRng,
    sketch_rules: Vec<Box<dyn SketchRule>>,
    init_rules: Vec<Box<dyn InitRule>>,
    split_memo: SplitFactorizationMemo,
    /// Sketches are deterministic per DAG, so they are generated once.
    sketch_cache: Vec<State>,

    measured_states_set: HashSet<String>,
    measured_states: Vec<State>,
    measured_throughputs: Vec<f64>,

    best_state: Option<State>,
    best_cost: f64,
    /// Measurement count at which the current best was found.
    best_ct: usize,
    num_measure_per_iter: usize,
}

impl SketchSearchPolicy {
    pub fn new(task: SearchTask, cost_model: Box<dyn CostModel>, params: SearchParams, seed: u64) -> Self {
        Self {
            task,
            params,
            cost_model,
            rng: StdRng::seed_from_u64(seed),
            sketch_rules: default_sketch_rules(),
            init_rules: default_init_rules(),
            split_memo: SplitFactorizationMemo::new(),
            sketch_cache: Vec::new(),
            measured_states_set: HashSet::new(),
            measured_states: Vec::new(),
            measured_throughputs: Vec::new(),
            best_state: None,
            best_cost: f64::INFINITY,
            best_ct: 0,
            num_measure_per_iter: 0,
        }
    }

    /// Construct and run init callbacks before the first search.
    pub fn with_callbacks(
        task: SearchTask,
        cost_model: Box<dyn CostModel>,
        params: SearchParams,
        seed: u64,
        callbacks: &[Box<dyn SearchCallback>],
    ) -> Result<Self> {
        let mut policy = Self::new(task, cost_model, params, seed);
        for callback in callbacks {
            callback.apply(&mut policy)?;
        }
        Ok(policy)
    }

    pub fn task(&self) -> &SearchTask {
        &self.task
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn measured_states(&self) -> &[State] {
        &self.measured_states
    }

    /// Seed the policy with externally measured results (log replay).
    pub fn preload_measured(&mut self, inputs: &[MeasureInput], results: &[MeasureResult]) {
        for (input, result) in inputs.iter().zip(results) {
            let key = input.state.to_canonical_string();
            if self.measured_states_set.insert(key) {
                self.measured_states.push(input.state.clone());
                self.measured_throughputs.push(1.0 / result.mean_cost());
            }
        }
        self.cost_model.update(inputs, results);
    }

    /// Run the search and return the best state found.
    ///
    /// With `n_trials <= 1` no measurement happens: one round of sampling
    /// runs and its first state is returned. `early_stopping < 0` disables
    /// early stopping.
    pub fn search(
        &mut self,
        n_trials: usize,
        early_stopping: i64,
        num_measure_per_iter: usize,
        measurer: &mut dyn Measurer,
    ) -> Result<State> {
        self.num_measure_per_iter = num_measure_per_iter;

        if n_trials <= 1 {
            let (best_states, _) = self.search_one_round(0)?;
            return best_states.into_iter().next().ok_or_else(|| NoSketchesSnafu.build());
        }

        let num_random = (self.params.eps_greedy * num_measure_per_iter as f32) as usize;
        let early_stopping: usize =
            if early_stopping < 0 { (i64::MAX >> 1) as usize } else { early_stopping as usize };

        let mut inputs: Vec<MeasureInput> = Vec::new();
        let mut results: Vec<MeasureResult> = Vec::new();
        let mut ct = 0usize;

        while ct < n_trials {
            if !inputs.is_empty() {
                tracing::info!(num_samples = inputs.len(), "training cost model");
                self.cost_model.update(&inputs, &results);
            }

            tracing::info!(ct, n_trials, "search round");
            let (best_states, random_states) = self.search_one_round(num_random)?;

            // Bounds must be known for canonical strings to be comparable.
            let best_states = self.task.dag.infer_bound_batch(&best_states)?;
            let random_states = self.task.dag.infer_bound_batch(&random_states)?;

            inputs = self.pick_states_with_eps_greedy(&best_states, &random_states, n_trials - ct);
            if inputs.is_empty() {
                tracing::info!("all candidates in the search space have been measured");
                break;
            }

            tracing::info!(num_inputs = inputs.len(), "measuring");
            results = match measurer.measure(&self.task, &inputs) {
                Ok(results) => results,
                Err(err) => {
                    // The batch was picked but never ran; drop it so the
                    // measured-state and throughput vectors stay aligned.
                    self.measured_states.truncate(self.measured_throughputs.len());
                    tracing::warn!(%err, "measurement aborted; returning current best");
                    break;
                }
            };
            let batch_start = ct;
            ct += inputs.len();

            for (pos, result) in results.iter().enumerate() {
                let cost = result.mean_cost();
                self.measured_throughputs.push(1.0 / cost);
                if cost < self.best_cost {
                    self.best_cost = cost;
                    self.best_state = Some(inputs[pos].state.clone());
                    self.best_ct = batch_start + pos + 1;
                }
            }

            if ct - self.best_ct > early_stopping {
                tracing::info!(ct, best_ct = self.best_ct, "early stopping");
                break;
            }
        }

        match self.best_state.clone() {
            Some(best) => Ok(best),
            // Nothing was measured; fall back to a freshly sampled state.
            None => {
                let (best_states, _) = self.search_one_round(0)?;
                best_states.into_iter().next().ok_or_else(|| NoSketchesSnafu.build())
            }
        }
    }

    /// One round of sampling: returns (best candidates, random candidates).
    fn search_one_round(&mut self, num_random: usize) -> Result<(Vec<State>, Vec<State>)> {
        let population = self.params.sample_init_min_population;
        let num_use_measured = self
            .measured_states
            .len()
            .min((self.params.evolution.use_measured_ratio * population as f32) as usize);
        let informative = self.cost_model.is_informative();

        if self.sketch_cache.is_empty() {
            self.sketch_cache = self.generate_sketches()?;
        }
        let sketches = self.sketch_cache.clone();

        let sample_count = if informative { population.saturating_sub(num_use_measured).max(1) } else { population };
        let mut init_population = self.sample_init_population(&sketches, sample_count)?;

        if informative {
            // Seed with the best previously measured states.
            let mut order: Vec<usize> = (0..self.measured_throughputs.len()).collect();
            order.sort_by(|&a, &b| {
                self.measured_throughputs[b]
                    .partial_cmp(&self.measured_throughputs[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for &idx in order.iter().take(num_use_measured) {
                init_population.push(self.measured_states[idx].clone());
            }

            let best = self.evolutionary_search(&init_population, self.num_measure_per_iter * 2)?;
            let random = self.random_sample_states(&init_population, num_random * 10);
            Ok((best, random))
        } else {
            // Uninformative model: selection degrades to uniform sampling.
            let best = self.random_sample_states(&init_population, self.num_measure_per_iter.max(1) * 3);
            Ok((best, Vec::new()))
        }
    }

    /// Rule-directed sketch enumeration over stages, last stage first.
    ///
    /// Deterministic for a given DAG and rule order.
    pub fn generate_sketches(&self) -> Result<Vec<State>> {
        let init_state = self.task.dag.init_state();
        let ctx = SketchContext { task: &self.task, params: &self.params };

        let num_stages = init_state.stages().len();
        let mut frontier: Vec<(State, Option<usize>)> = vec![(init_state, num_stages.checked_sub(1))];
        let mut out_states = Vec::new();

        // Double-buffered frontier walk.
        while !frontier.is_empty() {
            let mut next_frontier = Vec::new();
            for (state, cursor) in frontier.drain(..) {
                let Some(stage_id) = cursor else {
                    out_states.push(state);
                    continue;
                };
                for rule in &self.sketch_rules {
                    let cond = rule.meet_condition(&ctx, &state, stage_id);
                    if cond != ConditionKind::Pass {
                        next_frontier.extend(rule.apply(&ctx, &state, stage_id)?);
                        if cond == ConditionKind::ApplyAndSkipRest {
                            break;
                        }
                    }
                }
            }
            frontier = next_frontier;
        }

        // Rfactor post-pass: the split feeding an rfactor was applied with a
        // placeholder factor (an unknown factor cannot be replayed through
        // the rfactor), but its size must be sampled like any other tile
        // size. Reset it to unknown and re-derive the stages.
        for state in &mut out_states {
            let rfactor_steps: Vec<usize> = state
                .transform_steps()
                .iter()
                .enumerate()
                .filter(|(_, s)| matches!(s, TransformStep::Rfactor { .. }))
                .map(|(i, _)| i)
                .collect();
            if rfactor_steps.is_empty() {
                continue;
            }
            for step_id in rfactor_steps {
                let split_id = step_id.checked_sub(1).ok_or_else(|| {
                    crate::error::Error::from(zorya_dag::error::RfactorWithoutSplitSnafu { step_id }.build())
                })?;
                let TransformStep::Split { stage_id, iter_id, extent, lengths, inner_to_outer } =
                    state.transform_steps()[split_id].clone()
                else {
                    return Err(zorya_dag::error::RfactorWithoutSplitSnafu { step_id }.build().into());
                };
                state.replace_step(
                    split_id,
                    TransformStep::Split {
                        stage_id,
                        iter_id,
                        extent,
                        lengths: lengths.iter().map(|_| None).collect(),
                        inner_to_outer,
                    },
                );
            }
            *state = state.rederive()?;
        }

        tracing::info!(num_sketches = out_states.len(), "generated sketches");
        Ok(out_states)
    }

    /// Sample up to `out_size` concrete candidates by annotating random
    /// sketches with the init rules. Sampling stops early after `out_size`
    /// consecutive-equivalent failures.
    pub fn sample_init_population(&mut self, sketches: &[State], out_size: usize) -> Result<Vec<State>> {
        snafu::ensure!(!sketches.is_empty(), NoSketchesSnafu);

        let mut out_states = Vec::with_capacity(out_size);
        let mut fail_ct = 0usize;
        while out_states.len() < out_size && fail_ct < out_size {
            let pick = self.rng.gen_range(0..sketches.len());
            let mut state = sketches[pick].clone();

            let mut valid = true;
            let mut ctx = InitContext {
                task: &self.task,
                params: &self.params,
                rng: &mut self.rng,
                split_memo: &mut self.split_memo,
            };
            for rule in &self.init_rules {
                if rule.apply(&mut ctx, &mut state)? == InitResultKind::Invalid {
                    valid = false;
                    break;
                }
            }

            if valid {
                out_states.push(self.task.dag.infer_bound(&state)?);
            } else {
                fail_ct += 1;
            }
        }
        tracing::info!(num_states = out_states.len(), fail_ct, "sampled init population");
        Ok(out_states)
    }

    /// Evolutionary refinement: score, select by roulette wheel, mutate.
    ///
    /// Returns the `out_size` best unique states seen across generations.
    fn evolutionary_search(&mut self, init_population: &[State], out_size: usize) -> Result<Vec<State>> {
        if init_population.is_empty() {
            return Ok(Vec::new());
        }
        let num_iters = self.params.evolution.num_iters;
        let population_size = self.params.evolution.population.min(init_population.len().max(1) * 4);

        let mut population: Vec<State> = init_population.to_vec();
        let mut best: Vec<(f32, State)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for generation in 0..=num_iters {
            let mut scores = self.cost_model.predict(&self.task, &population);
            if scores.iter().any(|s| s.is_nan()) {
                tracing::warn!("cost model produced NaN scores; falling back to insertion order");
                scores = (0..population.len()).rev().map(|i| i as f32).collect();
            }

            for (state, &score) in population.iter().zip(&scores) {
                if seen.insert(state.to_canonical_string()) {
                    best.push((score, state.clone()));
                }
            }
            best.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            best.truncate(out_size.max(1) * 2);

            if generation == num_iters {
                break;
            }

            // Roulette-wheel selection over scores shifted to positive.
            let min_score = scores.iter().copied().fold(f32::INFINITY, f32::min);
            let weights: Vec<f32> = scores.iter().map(|s| s - min_score + 1e-3).collect();
            let total: f32 = weights.iter().sum();

            let mut next = Vec::with_capacity(population_size);
            for _ in 0..population_size {
                let mut pick = self.rng.gen_range(0.0..total.max(1e-3));
                let mut parent = population.len() - 1;
                for (pos, weight) in weights.iter().enumerate() {
                    if pick < *weight {
                        parent = pos;
                        break;
                    }
                    pick -= weight;
                }
                next.push(self.mutate(&population[parent])?);
            }
            population = next;
        }

        tracing::info!(num_states = best.len().min(out_size), "evolutionary search done");
        Ok(best.into_iter().take(out_size).map(|(_, state)| state).collect())
    }

    /// Apply one random mutation; a mutation that does not apply degrades to
    /// a copy of the parent.
    fn mutate(&mut self, parent: &State) -> Result<State> {
        let mutated = if self.rng.gen_range(0..2) == 0 {
            self.mutate_tile_size(parent)?
        } else {
            self.mutate_compute_location(parent)?
        };
        Ok(mutated.unwrap_or_else(|| parent.clone()))
    }

    /// Re-sample the factorization of one random split step.
    fn mutate_tile_size(&mut self, parent: &State) -> Result<Option<State>> {
        let split_ids: Vec<usize> = parent
            .transform_steps()
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, TransformStep::Split { lengths, .. } if !lengths.is_empty()))
            .map(|(pos, _)| pos)
            .collect();
        if split_ids.is_empty() {
            return Ok(None);
        }
        let step_id = split_ids[self.rng.gen_range(0..split_ids.len())];
        let TransformStep::Split { stage_id, iter_id, extent, lengths, inner_to_outer } =
            parent.transform_steps()[step_id].clone()
        else {
            unreachable!("filtered to split steps");
        };
        let Some(extent) = extent else { return Ok(None) };

        let schemes = self.split_memo.get_factorization_schemes(
            extent,
            lengths.len(),
            self.params.max_innermost_split_factor,
        );
        if schemes.len() < 2 {
            return Ok(None);
        }
        let scheme = &schemes[self.rng.gen_range(0..schemes.len())];

        let mut child = parent.clone();
        child.replace_step(
            step_id,
            TransformStep::Split {
                stage_id,
                iter_id,
                extent: Some(extent),
                lengths: scheme.iter().map(|&l| Some(l)).collect(),
                inner_to_outer,
            },
        );
        let child = child.rederive()?;
        Ok(Some(self.task.dag.infer_bound(&child)?))
    }

    /// Move one random relocatable stage to another legal compute location.
    fn mutate_compute_location(&mut self, parent: &State) -> Result<Option<State>> {
        if self.params.disable_change_compute_location {
            return Ok(None);
        }
        let eligible: Vec<usize> = (0..parent.stages().len())
            .filter(|&stage_id| {
                let stage = &parent.stages()[stage_id];
                !stage.is_placeholder()
                    && stage.compute_at != ComputeAt::Inlined
                    && !stage.is_tiled()
                    && !needs_multi_level_tiling(parent, stage_id)
                    && get_single_consumer_id(parent, stage_id).is_some()
            })
            .collect();
        if eligible.is_empty() {
            return Ok(None);
        }
        let stage_id = eligible[self.rng.gen_range(0..eligible.len())];
        let target_id = get_single_consumer_id(parent, stage_id).expect("filtered to single-consumer stages");

        let mut child = parent.clone();
        let candidates = enumerate_attach_candidates(&child, target_id);
        let choice = self.rng.gen_range(0..candidates.len() + 1);
        if choice == 0 {
            child.compute_root(stage_id)?;
        } else {
            let (target, iter) = candidates[choice - 1];
            child.compute_at(stage_id, target, iter)?;
        }
        Ok(Some(self.task.dag.infer_bound(&child)?))
    }

    /// Uniform sample of `n` states from a pool, with replacement.
    fn random_sample_states(&mut self, pool: &[State], n: usize) -> Vec<State> {
        if pool.is_empty() {
            return Vec::new();
        }
        (0..n).map(|_| pool[self.rng.gen_range(0..pool.len())].clone()).collect()
    }

    /// Interleave best-first and random-first picks into one measurement
    /// batch, deduplicating against everything measured so far.
    fn pick_states_with_eps_greedy(
        &mut self,
        best_states: &[State],
        random_states: &[State],
        remaining: usize,
    ) -> Vec<MeasureInput> {
        let num_random =
            ((self.params.eps_greedy * self.num_measure_per_iter as f32) as usize).min(self.num_measure_per_iter);
        let num_good = self.num_measure_per_iter - num_random;
        let cap = self.num_measure_per_iter.min(remaining);

        let mut inputs = Vec::with_capacity(cap);
        let (mut offset_best, mut offset_random) = (0usize, 0usize);

        while inputs.len() < cap {
            let state = if inputs.len() < num_good {
                // Prefer the cost-model picks.
                if offset_best < best_states.len() {
                    offset_best += 1;
                    &best_states[offset_best - 1]
                } else if offset_random < random_states.len() {
                    offset_random += 1;
                    &random_states[offset_random - 1]
                } else {
                    break;
                }
            } else {
                // Prefer the random picks.
                if offset_random < random_states.len() {
                    offset_random += 1;
                    &random_states[offset_random - 1]
                } else if offset_best < best_states.len() {
                    offset_best += 1;
                    &best_states[offset_best - 1]
                } else {
                    break;
                }
            };

            let key = state.to_canonical_string();
            if self.measured_states_set.insert(key) {
                self.measured_states.push(state.clone());
                inputs.push(MeasureInput::new(&self.task, state.clone()));
            }
        }
        inputs
    }
}
