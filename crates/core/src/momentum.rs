//! Momentum (EMA) teacher synchronisation.
//!
//! Student and teacher own separate [`VarMap`]s. [`MomentumSync`] pairs
//! every teacher parameter with its student source once, by name, and then
//! only ever writes in one direction: student -> teacher.

use candle_core::{DType, Var};
use candle_nn::VarMap;
use thiserror::Error;

use crate::head::{BACKBONE, PREDICTOR, PROJECTOR};

#[derive(Error, Debug)]
pub enum MomentumError {
    #[error("teacher parameter {teacher} has no student counterpart {student}")]
    MissingStudentParam { teacher: String, student: String },

    #[error("teacher parameter {name} must not belong to the predictor")]
    TeacherPredictor { name: String },

    #[error("shape mismatch for {name}: teacher {teacher:?}, student {student:?}")]
    ShapeMismatch {
        name: String,
        teacher: Vec<usize>,
        student: Vec<usize>,
    },

    #[error("a per-layer teacher projector needs a per-layer student projector")]
    UnsupportedHeads,

    #[error("momentum {0} is outside [0, 1]")]
    InvalidMomentum(f64),

    #[error("parameter store lock poisoned")]
    Poisoned,

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MomentumError>;

/// Which student projector feeds the teacher projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadPolicy {
    /// Both sides have the same projector layout; names match one to one.
    Whole,
    /// The student has one projector per block and the teacher a single
    /// one: the final block's projector (`projector.{depth-1}`) is used.
    FinalLayer { depth: usize },
}

impl HeadPolicy {
    pub fn for_modes(
        student_intermediate: bool,
        teacher_intermediate: bool,
        depth: usize,
    ) -> Result<Self> {
        match (student_intermediate, teacher_intermediate) {
            (true, false) => Ok(HeadPolicy::FinalLayer { depth }),
            (false, true) => Err(MomentumError::UnsupportedHeads),
            _ => Ok(HeadPolicy::Whole),
        }
    }

    /// Student parameter name that feeds the given teacher parameter.
    pub fn student_name(&self, teacher_name: &str) -> String {
        let projector = format!("{PROJECTOR}.");
        match self {
            HeadPolicy::FinalLayer { depth } if teacher_name.starts_with(&projector) => {
                let rest = &teacher_name[projector.len()..];
                format!("{PROJECTOR}.{}.{rest}", depth.saturating_sub(1))
            }
            _ => teacher_name.to_string(),
        }
    }
}

struct ParamPair {
    name: String,
    teacher: Var,
    student: Var,
}

/// One-directional student -> teacher parameter synchronisation.
pub struct MomentumSync {
    pairs: Vec<ParamPair>,
}

impl MomentumSync {
    pub fn new(student: &VarMap, teacher: &VarMap, policy: HeadPolicy) -> Result<Self> {
        let student_vars = student.data().lock().map_err(|_| MomentumError::Poisoned)?;
        let teacher_vars = teacher.data().lock().map_err(|_| MomentumError::Poisoned)?;

        let mut names: Vec<&String> = teacher_vars.keys().collect();
        names.sort();

        let predictor = format!("{PREDICTOR}.");
        let mut pairs = Vec::with_capacity(names.len());
        for name in names {
            if name.starts_with(&predictor) {
                return Err(MomentumError::TeacherPredictor { name: name.clone() });
            }
            let student_name = policy.student_name(name);
            let teacher_var = &teacher_vars[name];
            let student_var = student_vars.get(&student_name).ok_or_else(|| {
                MomentumError::MissingStudentParam {
                    teacher: name.clone(),
                    student: student_name.clone(),
                }
            })?;
            if teacher_var.dims() != student_var.dims() {
                return Err(MomentumError::ShapeMismatch {
                    name: name.clone(),
                    teacher: teacher_var.dims().to_vec(),
                    student: student_var.dims().to_vec(),
                });
            }
            pairs.push(ParamPair {
                name: name.clone(),
                teacher: teacher_var.clone(),
                student: student_var.clone(),
            });
        }

        tracing::debug!(
            pairs = pairs.len(),
            backbone = pairs.iter().filter(|p| p.name.starts_with(BACKBONE)).count(),
            ?policy,
            "paired teacher parameters"
        );
        Ok(Self { pairs })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Overwrite every teacher parameter with its student source.
    pub fn copy_student_into_teacher(&self) -> Result<()> {
        for pair in &self.pairs {
            pair.teacher.set(pair.student.as_tensor())?;
        }
        Ok(())
    }

    /// `teacher = m * teacher + (1 - m) * student` for every pair.
    pub fn ema_update(&self, momentum: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&momentum) {
            return Err(MomentumError::InvalidMomentum(momentum));
        }
        if momentum == 1.0 {
            return Ok(());
        }
        for pair in &self.pairs {
            let teacher = pair.teacher.as_tensor().affine(momentum, 0.0)?;
            let student = pair.student.as_tensor().affine(1.0 - momentum, 0.0)?;
            pair.teacher.set(&(teacher + student)?.detach())?;
        }
        Ok(())
    }

    /// Largest absolute teacher/student difference across all pairs.
    pub fn max_abs_diff(&self) -> Result<f32> {
        let mut max = 0f32;
        for pair in &self.pairs {
            let diff = (pair.teacher.as_tensor() - pair.student.as_tensor())?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()?;
            max = max.max(diff);
        }
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VitConfig;
    use crate::head::{EmbeddingNet, HeadConfig};
    use candle_core::Device;
    use candle_nn::VarBuilder;

    fn tiny_cfg() -> VitConfig {
        VitConfig {
            image_size: 16,
            patch_size: 8,
            embed_dim: 8,
            depth: 2,
            num_heads: 2,
            ..VitConfig::default()
        }
    }

    const HEAD: HeadConfig = HeadConfig {
        out_dim: 4,
        hidden_dim: 8,
    };

    fn nets(student_inter: bool) -> (VarMap, VarMap) {
        let device = Device::Cpu;
        let student = VarMap::new();
        let teacher = VarMap::new();
        EmbeddingNet::new(
            &tiny_cfg(),
            &HEAD,
            student_inter,
            true,
            VarBuilder::from_varmap(&student, DType::F32, &device),
        )
        .unwrap();
        EmbeddingNet::new(
            &tiny_cfg(),
            &HEAD,
            false,
            false,
            VarBuilder::from_varmap(&teacher, DType::F32, &device),
        )
        .unwrap();
        (student, teacher)
    }

    fn snapshot(varmap: &VarMap, name: &str) -> Vec<f32> {
        varmap.data().lock().unwrap()[name]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn momentum_one_leaves_teacher_unchanged() {
        let (student, teacher) = nets(false);
        let sync = MomentumSync::new(&student, &teacher, HeadPolicy::Whole).unwrap();
        let before = snapshot(&teacher, "backbone.blocks.0.attn.qkv.weight");
        sync.ema_update(1.0).unwrap();
        assert_eq!(snapshot(&teacher, "backbone.blocks.0.attn.qkv.weight"), before);
    }

    #[test]
    fn momentum_zero_copies_student() {
        let (student, teacher) = nets(false);
        let sync = MomentumSync::new(&student, &teacher, HeadPolicy::Whole).unwrap();
        assert!(sync.max_abs_diff().unwrap() > 0.0);
        sync.ema_update(0.0).unwrap();
        assert_eq!(sync.max_abs_diff().unwrap(), 0.0);
    }

    #[test]
    fn ema_interpolates() {
        let (student, teacher) = nets(false);
        let sync = MomentumSync::new(&student, &teacher, HeadPolicy::Whole).unwrap();
        let name = "projector.fc1.weight";
        let t0 = snapshot(&teacher, name);
        let s0 = snapshot(&student, name);
        sync.ema_update(0.75).unwrap();
        let t1 = snapshot(&teacher, name);
        for ((t1, t0), s0) in t1.iter().zip(&t0).zip(&s0) {
            assert!((t1 - (0.75 * t0 + 0.25 * s0)).abs() < 1e-6);
        }
        // Student is never written.
        assert_eq!(snapshot(&student, name), s0);
    }

    #[test]
    fn final_layer_policy_maps_last_student_projector() {
        let (student, teacher) = nets(true);
        let policy = HeadPolicy::for_modes(true, false, 2).unwrap();
        assert_eq!(policy.student_name("projector.fc2.bias"), "projector.1.fc2.bias");
        assert_eq!(
            policy.student_name("backbone.cls_token"),
            "backbone.cls_token"
        );

        let sync = MomentumSync::new(&student, &teacher, policy).unwrap();
        sync.copy_student_into_teacher().unwrap();
        assert_eq!(
            snapshot(&teacher, "projector.fc1.weight"),
            snapshot(&student, "projector.1.fc1.weight")
        );
        assert_eq!(sync.max_abs_diff().unwrap(), 0.0);
    }

    #[test]
    fn mismatched_layout_is_rejected() {
        let (student, teacher) = nets(true);
        let err = MomentumSync::new(&student, &teacher, HeadPolicy::Whole).err().unwrap();
        assert!(matches!(err, MomentumError::MissingStudentParam { .. }));
        assert!(matches!(
            HeadPolicy::for_modes(false, true, 2),
            Err(MomentumError::UnsupportedHeads)
        ));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let device = Device::Cpu;
        let student = VarMap::new();
        let teacher = VarMap::new();
        VarBuilder::from_varmap(&student, DType::F32, &device)
            .get((2, 3), "backbone.w")
            .unwrap();
        VarBuilder::from_varmap(&teacher, DType::F32, &device)
            .get((3, 2), "backbone.w")
            .unwrap();
        let err = MomentumSync::new(&student, &teacher, HeadPolicy::Whole).err().unwrap();
        assert!(matches!(err, MomentumError::ShapeMismatch { .. }));

        let sync = MomentumSync { pairs: Vec::new() };
        assert!(matches!(
            sync.ema_update(1.5),
            Err(MomentumError::InvalidMomentum(_))
        ));
    }
}
