//! Trainable classifier head.
//!
//! A small fully-connected network over frozen backbone features:
//! dense 512 (ReLU) → dropout 0.5 → dense 256 (ReLU) → dropout 0.3 →
//! dense `num_classes` → softmax. The backbone is never trained; only
//! this head is, which keeps training tractable with the handful of
//! reference images available per enrolled identity.
//!
//! Training uses Adam with categorical cross-entropy, a stratified
//! train/validation split, early stopping on validation loss, and a
//! snapshot of the best-validation-accuracy weights which is restored
//! at the end.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ClassifierError;

// --- Architecture and optimizer constants ---
const HIDDEN_1: usize = 512;
const HIDDEN_2: usize = 256;
const DROPOUT_1: f32 = 0.5;
const DROPOUT_2: f32 = 0.3;
const ADAM_BETA_1: f32 = 0.9;
const ADAM_BETA_2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;
const PROB_FLOOR: f32 = 1e-12;

/// Training hyperparameters with the fixed defaults used in production.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub max_epochs: usize,
    pub batch_size: usize,
    /// Early-stopping patience window on validation loss.
    pub patience: usize,
    pub learning_rate: f32,
    pub validation_split: f32,
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            max_epochs: 20,
            batch_size: 32,
            patience: 5,
            learning_rate: 1e-3,
            validation_split: 0.2,
            seed: 42,
        }
    }
}

/// Outcome of a completed training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    /// Final-epoch accuracy on the training split, in [0, 1].
    pub train_accuracy: f32,
    /// Final-epoch accuracy on the validation split, in [0, 1].
    pub val_accuracy: f32,
    pub num_classes: usize,
    pub num_samples: usize,
    pub epochs_run: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DenseLayer {
    /// Shape (input, output).
    weights: Array2<f32>,
    biases: Array1<f32>,
}

impl DenseLayer {
    fn new(input: usize, output: usize, rng: &mut StdRng) -> Self {
        // Glorot-uniform initialization.
        let scale = (6.0 / (input + output) as f32).sqrt();
        let weights = Array2::from_shape_fn((input, output), |_| rng.gen_range(-scale..scale));
        Self {
            weights,
            biases: Array1::zeros(output),
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weights) + &self.biases
    }
}

/// Per-layer Adam moment estimates.
struct AdamState {
    mw: Array2<f32>,
    vw: Array2<f32>,
    mb: Array1<f32>,
    vb: Array1<f32>,
}

impl AdamState {
    fn for_layer(layer: &DenseLayer) -> Self {
        Self {
            mw: Array2::zeros(layer.weights.raw_dim()),
            vw: Array2::zeros(layer.weights.raw_dim()),
            mb: Array1::zeros(layer.biases.raw_dim()),
            vb: Array1::zeros(layer.biases.raw_dim()),
        }
    }

    /// One Adam update for this layer. `t` is the global step count,
    /// shared across layers within a batch.
    fn apply(
        &mut self,
        layer: &mut DenseLayer,
        gw: &Array2<f32>,
        gb: &Array1<f32>,
        lr: f32,
        t: usize,
    ) {
        let bias1 = 1.0 - ADAM_BETA_1.powi(t as i32);
        let bias2 = 1.0 - ADAM_BETA_2.powi(t as i32);

        self.mw = &self.mw * ADAM_BETA_1 + gw * (1.0 - ADAM_BETA_1);
        self.vw = &self.vw * ADAM_BETA_2 + &gw.mapv(|g| g * g) * (1.0 - ADAM_BETA_2);
        let step_w = (&self.mw / bias1) * lr / &self.vw.mapv(|v| (v / bias2).sqrt() + ADAM_EPS);
        layer.weights = &layer.weights - &step_w;

        self.mb = &self.mb * ADAM_BETA_1 + gb * (1.0 - ADAM_BETA_1);
        self.vb = &self.vb * ADAM_BETA_2 + &gb.mapv(|g| g * g) * (1.0 - ADAM_BETA_2);
        let step_b = (&self.mb / bias1) * lr / &self.vb.mapv(|v| (v / bias2).sqrt() + ADAM_EPS);
        layer.biases = &layer.biases - &step_b;
    }
}

/// The trainable softmax classification head.
///
/// The output width is fixed to the class count seen at construction;
/// a roster change requires building a fresh head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftmaxHead {
    feature_dim: usize,
    num_classes: usize,
    fc1: DenseLayer,
    fc2: DenseLayer,
    out: DenseLayer,
}

impl SoftmaxHead {
    fn new(feature_dim: usize, num_classes: usize, rng: &mut StdRng) -> Self {
        Self {
            feature_dim,
            num_classes,
            fc1: DenseLayer::new(feature_dim, HIDDEN_1, rng),
            fc2: DenseLayer::new(HIDDEN_1, HIDDEN_2, rng),
            out: DenseLayer::new(HIDDEN_2, num_classes, rng),
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Inference forward pass: no dropout, deterministic.
    pub fn forward_probs(&self, x: &Array2<f32>) -> Array2<f32> {
        let a1 = self.fc1.forward(x).mapv(|v| v.max(0.0));
        let a2 = self.fc2.forward(&a1).mapv(|v| v.max(0.0));
        softmax(self.out.forward(&a2))
    }

    /// Top-1 class index and probability for a single feature vector.
    pub fn predict(&self, features: &Array1<f32>) -> (usize, f32) {
        let x = features.view().insert_axis(Axis(0)).to_owned();
        let probs = self.forward_probs(&x);
        let row = probs.index_axis(Axis(0), 0);
        let mut best = 0;
        let mut best_p = f32::MIN;
        for (i, &p) in row.iter().enumerate() {
            if p > best_p {
                best_p = p;
                best = i;
            }
        }
        (best, best_p)
    }

    /// Mean cross-entropy loss and accuracy over a labeled set.
    fn evaluate(&self, x: &Array2<f32>, y: &[usize]) -> (f32, f32) {
        if y.is_empty() {
            return (0.0, 0.0);
        }
        let probs = self.forward_probs(x);
        let mut loss = 0.0f32;
        let mut correct = 0usize;
        for (i, &label) in y.iter().enumerate() {
            let row = probs.index_axis(Axis(0), i);
            loss -= row[label].max(PROB_FLOOR).ln();
            let argmax = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(j, _)| j)
                .unwrap_or(0);
            if argmax == label {
                correct += 1;
            }
        }
        let n = y.len() as f32;
        (loss / n, correct as f32 / n)
    }

    /// Train a fresh head on `features` (one row per sample) and class
    /// indices `labels`. Requires at least 2 samples and 2 classes.
    pub fn fit(
        features: &Array2<f32>,
        labels: &[usize],
        num_classes: usize,
        opts: &TrainOptions,
    ) -> Result<(Self, TrainReport), ClassifierError> {
        let n = features.nrows();
        if n < 2 || labels.len() != n {
            return Err(ClassifierError::DataInsufficient { needed: 2, got: n });
        }
        if num_classes < 2 {
            return Err(ClassifierError::DataInsufficient {
                needed: 2,
                got: num_classes,
            });
        }

        let feature_dim = features.ncols();
        let mut rng = StdRng::seed_from_u64(opts.seed);

        let (train_idx, val_idx) = stratified_split(labels, opts.validation_split, &mut rng);
        let train_x = features.select(Axis(0), &train_idx);
        let train_y: Vec<usize> = train_idx.iter().map(|&i| labels[i]).collect();
        let val_x = features.select(Axis(0), &val_idx);
        let val_y: Vec<usize> = val_idx.iter().map(|&i| labels[i]).collect();

        tracing::debug!(
            train = train_idx.len(),
            val = val_idx.len(),
            classes = num_classes,
            "head training split"
        );

        let mut head = Self::new(feature_dim, num_classes, &mut rng);
        let mut adam = [
            AdamState::for_layer(&head.fc1),
            AdamState::for_layer(&head.fc2),
            AdamState::for_layer(&head.out),
        ];

        let mut order: Vec<usize> = (0..train_idx.len()).collect();

        let mut best_val_loss = f32::INFINITY;
        let mut best_val_acc = f32::MIN;
        let mut best_weights: Option<(DenseLayer, DenseLayer, DenseLayer)> = None;
        let mut patience_left = opts.patience;
        let mut step = 0usize;
        let mut last_train_acc = 0.0f32;
        let mut last_val_acc = 0.0f32;
        let mut epochs_run = 0usize;

        for epoch in 0..opts.max_epochs {
            epochs_run = epoch + 1;
            order.shuffle(&mut rng);

            for chunk in order.chunks(opts.batch_size.max(1)) {
                let batch_x = train_x.select(Axis(0), chunk);
                let batch_y: Vec<usize> = chunk.iter().map(|&i| train_y[i]).collect();
                step += 1;
                head.train_batch(&batch_x, &batch_y, &mut adam, opts.learning_rate, step, &mut rng);
            }

            let (train_loss, train_acc) = head.evaluate(&train_x, &train_y);
            let (val_loss, val_acc) = head.evaluate(&val_x, &val_y);
            last_train_acc = train_acc;
            last_val_acc = val_acc;

            tracing::debug!(
                epoch,
                train_loss,
                train_acc,
                val_loss,
                val_acc,
                "epoch complete"
            );

            // Checkpoint on best validation accuracy; ties keep the
            // earlier snapshot.
            if val_acc > best_val_acc {
                best_val_acc = val_acc;
                best_weights = Some((head.fc1.clone(), head.fc2.clone(), head.out.clone()));
            }

            // Early stopping on validation loss.
            if val_loss < best_val_loss {
                best_val_loss = val_loss;
                patience_left = opts.patience;
            } else {
                patience_left = patience_left.saturating_sub(1);
                if patience_left == 0 {
                    tracing::debug!(epoch, "early stopping: validation loss plateaued");
                    break;
                }
            }
        }

        if let Some((fc1, fc2, out)) = best_weights {
            head.fc1 = fc1;
            head.fc2 = fc2;
            head.out = out;
        }

        Ok((
            head,
            TrainReport {
                train_accuracy: last_train_acc,
                val_accuracy: last_val_acc,
                num_classes,
                num_samples: n,
                epochs_run,
            },
        ))
    }

    /// One minibatch of forward + backprop + Adam updates.
    fn train_batch(
        &mut self,
        x: &Array2<f32>,
        y: &[usize],
        adam: &mut [AdamState; 3],
        lr: f32,
        step: usize,
        rng: &mut StdRng,
    ) {
        let batch = x.nrows() as f32;

        // Forward with inverted dropout.
        let z1 = self.fc1.forward(x);
        let a1 = z1.mapv(|v| v.max(0.0));
        let m1 = dropout_mask(a1.dim(), DROPOUT_1, rng);
        let h1 = &a1 * &m1;

        let z2 = self.fc2.forward(&h1);
        let a2 = z2.mapv(|v| v.max(0.0));
        let m2 = dropout_mask(a2.dim(), DROPOUT_2, rng);
        let h2 = &a2 * &m2;

        let z3 = self.out.forward(&h2);
        let probs = softmax(z3);

        // Softmax + cross-entropy gradient: (p - onehot) / batch.
        let mut g3 = probs;
        for (i, &label) in y.iter().enumerate() {
            g3[[i, label]] -= 1.0;
        }
        g3.mapv_inplace(|v| v / batch);

        let gw3 = h2.t().dot(&g3);
        let gb3 = g3.sum_axis(Axis(0));
        let gh2 = g3.dot(&self.out.weights.t());

        let gz2 = &gh2 * &m2 * &z2.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let gw2 = h1.t().dot(&gz2);
        let gb2 = gz2.sum_axis(Axis(0));
        let gh1 = gz2.dot(&self.fc2.weights.t());

        let gz1 = &gh1 * &m1 * &z1.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let gw1 = x.t().dot(&gz1);
        let gb1 = gz1.sum_axis(Axis(0));

        adam[0].apply(&mut self.fc1, &gw1, &gb1, lr, step);
        adam[1].apply(&mut self.fc2, &gw2, &gb2, lr, step);
        adam[2].apply(&mut self.out, &gw3, &gb3, lr, step);
    }
}

/// Row-wise numerically-stable softmax.
fn softmax(mut logits: Array2<f32>) -> Array2<f32> {
    for mut row in logits.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum: f32 = row.iter().sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    logits
}

/// Inverted-dropout mask: zeros with probability `rate`, survivors
/// scaled by 1/(1-rate) so inference needs no rescaling.
fn dropout_mask(shape: (usize, usize), rate: f32, rng: &mut StdRng) -> Array2<f32> {
    let keep = 1.0 - rate;
    Array2::from_shape_fn(shape, |_| {
        if rng.gen::<f32>() < keep {
            1.0 / keep
        } else {
            0.0
        }
    })
}

/// Stratified train/validation split over class indices.
///
/// Each class contributes `floor(count * val_fraction)` validation
/// samples; a class with a single sample stays entirely on the training
/// side so no class disappears from training. If that leaves the
/// validation side empty, one sample is moved over from the largest
/// class.
pub(crate) fn stratified_split(
    labels: &[usize],
    val_fraction: f32,
    rng: &mut StdRng,
) -> (Vec<usize>, Vec<usize>) {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }

    let mut train = Vec::new();
    let mut val = Vec::new();
    let mut train_per_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

    for (class, mut idx) in by_class {
        idx.shuffle(rng);
        let n_val = if idx.len() < 2 {
            0
        } else {
            ((idx.len() as f32) * val_fraction).floor() as usize
        };
        val.extend_from_slice(&idx[..n_val]);
        train_per_class.insert(class, idx[n_val..].to_vec());
    }

    let total_train: usize = train_per_class.values().map(Vec::len).sum();
    if val.is_empty() && total_train > 1 {
        // Move one sample over from the class with the most training members.
        let largest = train_per_class
            .iter()
            .max_by_key(|(_, members)| members.len())
            .map(|(&class, _)| class);
        if let Some(class) = largest {
            if let Some(moved) = train_per_class.get_mut(&class).and_then(Vec::pop) {
                val.push(moved);
            }
        }
    }

    for members in train_per_class.into_values() {
        train.extend(members);
    }
    (train, val)
}
