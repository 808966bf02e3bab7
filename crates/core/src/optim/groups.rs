use candle_core::Var;
use candle_nn::VarMap;

use super::{OptimError, Result};

/// A parameter together with its name in the owning [`VarMap`].
#[derive(Clone)]
pub struct NamedVar {
    pub name: String,
    pub var: Var,
}

/// Parameters split by whether weight decay applies to them.
///
/// Biases and rank-1 tensors (norm scales and shifts) are never decayed.
pub struct ParamGroups {
    pub regularized: Vec<NamedVar>,
    pub not_regularized: Vec<NamedVar>,
}

impl ParamGroups {
    /// Group every variable of `varmap` whose name does not start with one of
    /// `frozen_prefixes`. Groups are sorted by name.
    pub fn from_varmap(varmap: &VarMap, frozen_prefixes: &[String]) -> Result<Self> {
        let data = varmap.data().lock().map_err(|_| OptimError::Poisoned)?;
        let mut named: Vec<NamedVar> = data
            .iter()
            .filter(|(name, _)| !frozen_prefixes.iter().any(|p| name.starts_with(p.as_str())))
            .map(|(name, var)| NamedVar {
                name: name.clone(),
                var: var.clone(),
            })
            .collect();
        named.sort_by(|a, b| a.name.cmp(&b.name));

        let (not_regularized, regularized) = named
            .into_iter()
            .partition(|p| is_unregularized(&p.name, p.var.rank()));
        Ok(Self {
            regularized,
            not_regularized,
        })
    }

    pub fn len(&self) -> usize {
        self.regularized.len() + self.not_regularized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All parameters with their weight-decay flag, regularized first.
    pub fn iter(&self) -> impl Iterator<Item = (&NamedVar, bool)> {
        self.regularized
            .iter()
            .map(|p| (p, true))
            .chain(self.not_regularized.iter().map(|p| (p, false)))
    }

    pub fn vars(&self) -> Vec<Var> {
        self.iter().map(|(p, _)| p.var.clone()).collect()
    }

    pub fn num_elements(&self) -> usize {
        self.iter().map(|(p, _)| p.var.elem_count()).sum()
    }
}

fn is_unregularized(name: &str, rank: usize) -> bool {
    name.ends_with(".bias") || rank == 1
}
