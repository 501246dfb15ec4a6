//! Pre-trained item-factor model
//!
//! Loaded once from a JSON artifact and shared read-only. Scoring a synthetic
//! user recomputes that user's latent factor from weighted interactions
//! (implicit-feedback ALS) and ranks every item against it.
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use ndarray::{Array1, Array2};
use serde::Deserialize;

use crate::{
    error::{AppError, AppResult},
    models::FilmId,
};

/// On-disk shape of the model artifact
#[derive(Debug, Deserialize)]
pub struct ModelArtifact {
    pub regularization: f32,
    pub items: Vec<String>,
    pub item_factors: Vec<Vec<f32>>,
}

#[derive(Debug)]
pub struct FactorModel {
    items: Vec<FilmId>,
    index: HashMap<FilmId, usize>,
    /// items × factors, widened once at load
    factors: Array2<f64>,
    /// Yᵀ·Y, shared by every user solve
    gram: Array2<f64>,
    regularization: f64,
}

impl FactorModel {
    pub fn new(items: Vec<FilmId>, factors: Array2<f32>, regularization: f32) -> AppResult<Self> {
        if items.len() != factors.nrows() {
            return Err(AppError::Model(format!(
                "{} items but {} factor rows",
                items.len(),
                factors.nrows()
            )));
        }
        if factors.ncols() == 0 {
            return Err(AppError::Model("factor matrix has no columns".to_string()));
        }
        if regularization.is_nan() || regularization < 0.0 {
            return Err(AppError::Model(format!(
                "invalid regularization {}",
                regularization
            )));
        }

        let mut index = HashMap::with_capacity(items.len());
        for (i, film_id) in items.iter().enumerate() {
            if index.insert(film_id.clone(), i).is_some() {
                return Err(AppError::Model(format!("duplicate item {}", film_id)));
            }
        }

        let factors = factors.mapv(f64::from);
        let gram = factors.t().dot(&factors);

        Ok(Self {
            items,
            index,
            factors,
            gram,
            regularization: f64::from(regularization),
        })
    }

    pub fn from_artifact(artifact: ModelArtifact) -> AppResult<Self> {
        let items = artifact
            .items
            .iter()
            .map(|raw| {
                FilmId::from_href(raw)
                    .ok_or_else(|| AppError::Model(format!("item '{}' is not a film id", raw)))
            })
            .collect::<AppResult<Vec<_>>>()?;

        let dims = artifact.item_factors.first().map_or(0, Vec::len);
        if artifact.item_factors.iter().any(|row| row.len() != dims) {
            return Err(AppError::Model("factor rows differ in length".to_string()));
        }

        let rows = artifact.item_factors.len();
        let flat: Vec<f32> = artifact.item_factors.into_iter().flatten().collect();
        let factors = Array2::from_shape_vec((rows, dims), flat)
            .map_err(|e| AppError::Model(e.to_string()))?;

        Self::new(items, factors, artifact.regularization)
    }

    pub fn from_json(json: &str) -> AppResult<Self> {
        Self::from_artifact(serde_json::from_str(json)?)
    }

    pub async fn load(path: &Path) -> AppResult<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        let model = Self::from_json(&json)?;

        tracing::info!(
            path = %path.display(),
            items = model.n_items(),
            factors = model.n_factors(),
            "Loaded factor model"
        );

        Ok(model)
    }

    pub fn n_items(&self) -> usize {
        self.items.len()
    }

    pub fn n_factors(&self) -> usize {
        self.factors.ncols()
    }

    pub fn index_of(&self, film_id: &FilmId) -> Option<usize> {
        self.index.get(film_id).copied()
    }

    pub fn film_at(&self, index: usize) -> Option<&FilmId> {
        self.items.get(index)
    }

    /// Latent factor of a user with the given (item, confidence) pairs
    ///
    /// Solves (YᵀY + λI + Σ (cᵢ − 1)·yᵢyᵢᵀ) x = Σ cᵢ·yᵢ.
    pub fn user_factor(&self, interactions: &[(usize, f32)]) -> Option<Array1<f64>> {
        let dims = self.n_factors();
        let mut a = self.gram.clone();
        let mut b = Array1::<f64>::zeros(dims);

        for d in 0..dims {
            a[[d, d]] += self.regularization;
        }

        for &(item, confidence) in interactions {
            if item >= self.n_items() {
                continue;
            }
            let y = self.factors.row(item);
            let c = f64::from(confidence);
            for i in 0..dims {
                b[i] += c * y[i];
                for j in 0..dims {
                    a[[i, j]] += (c - 1.0) * y[i] * y[j];
                }
            }
        }

        solve(a, b)
    }

    /// Top `k` unseen items for one synthetic user, best first
    ///
    /// Items in `interactions` are never returned. Equal scores keep item
    /// order.
    pub fn recommend(&self, interactions: &[(usize, f32)], k: usize) -> Vec<(usize, f32)> {
        if interactions.is_empty() || k == 0 {
            return Vec::new();
        }
        let Some(user) = self.user_factor(interactions) else {
            tracing::warn!(interactions = interactions.len(), "User factor solve failed");
            return Vec::new();
        };

        let known: HashSet<usize> = interactions.iter().map(|(i, _)| *i).collect();
        let scores = self.factors.dot(&user);

        let mut ranked: Vec<(usize, f32)> = scores
            .iter()
            .enumerate()
            .filter(|(i, score)| !known.contains(i) && score.is_finite())
            .map(|(i, score)| (i, *score as f32))
            .collect();

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked.truncate(k);
        ranked
    }
}

/// Gaussian elimination with partial pivoting; `None` if singular
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();

    for col in 0..n {
        let pivot = (col..n).max_by(|&r, &s| {
            a[[r, col]]
                .abs()
                .partial_cmp(&a[[s, col]].abs())
                .unwrap_or(Ordering::Equal)
        })?;
        let pivot_value = a[[pivot, col]].abs();
        if pivot_value.is_nan() || pivot_value <= 1e-12 {
            return None;
        }
        if pivot != col {
            for j in 0..n {
                a.swap([col, j], [pivot, j]);
            }
            b.swap(col, pivot);
        }

        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for j in col..n {
                a[[row, j]] -= factor * a[[col, j]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|j| a[[row, j]] * x[j]).sum();
        x[row] = (b[row] - tail) / a[[row, row]];
    }

    x.iter().all(|v| v.is_finite()).then_some(x)
}
