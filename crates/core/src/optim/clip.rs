use candle_core::backprop::GradStore;
use candle_core::{DType, Var};

use super::Result;

/// Rescale gradients so that their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. `max_norm <= 0` disables clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let total = global_grad_norm(grads, vars)?;
    if max_norm <= 0.0 || total <= max_norm {
        return Ok(total);
    }

    let scale = max_norm / (total + 1e-6);
    for var in vars {
        let clipped = match grads.get(var.as_tensor()) {
            Some(grad) => grad.affine(scale, 0.0)?,
            None => continue,
        };
        grads.insert(var.as_tensor(), clipped);
    }
    Ok(total)
}

/// L2 norm over the gradients of all `vars` that have one.
pub fn global_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f32>()?;
            sum_sq += sq as f64;
        }
    }
    Ok(sum_sq.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn setup() -> (Var, Var, GradStore) {
        let device = Device::Cpu;
        let a = Var::new(&[1f32, 2.0], &device).unwrap();
        let b = Var::new(&[[0.5f32]], &device).unwrap();
        // d/da = [3, 0], d/db = [[4]]  -> global norm 5
        let weights = Tensor::new(&[3f32, 0.0], &device).unwrap();
        let loss = ((a.as_tensor() * &weights).unwrap().sum_all().unwrap()
            + (b.as_tensor() * 4.0).unwrap().sum_all().unwrap())
        .unwrap();
        let grads = loss.backward().unwrap();
        (a, b, grads)
    }

    #[test]
    fn clips_to_max_norm() {
        let (a, b, mut grads) = setup();
        let vars = vec![a.clone(), b.clone()];
        let before = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((before - 5.0).abs() < 1e-5);
        let after = global_grad_norm(&grads, &vars).unwrap();
        assert!((after - 1.0).abs() < 1e-4);

        let ga: Vec<f32> = grads.get(a.as_tensor()).unwrap().to_vec1().unwrap();
        assert!((ga[0] - 0.6).abs() < 1e-4);
    }

    #[test]
    fn leaves_small_gradients_alone() {
        let (a, b, mut grads) = setup();
        let vars = vec![a.clone(), b];
        clip_grad_norm(&mut grads, &vars, 10.0).unwrap();
        let ga: Vec<f32> = grads.get(a.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(ga, vec![3.0, 0.0]);

        let (a, b, mut grads) = setup();
        let vars = vec![a.clone(), b];
        clip_grad_norm(&mut grads, &vars, 0.0).unwrap();
        let ga: Vec<f32> = grads.get(a.as_tensor()).unwrap().to_vec1().unwrap();
        assert_eq!(ga, vec![3.0, 0.0]);
    }
}
