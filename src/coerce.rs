//! By-value coercion between the two type systems.
//!
//! Outbound, the coercer decides how a native value becomes a wire
//! [`Value`]: numerics of unspecified precision are fitted to the smallest
//! representable type, homogeneous numeric arrays switch to the
//! shared-memory path past a size threshold, and everything else follows
//! the default rules. The hook chain runs in a fixed order: the
//! typed-scalar fast path (a caller-pinned wire type is honoured as-is),
//! then any user-registered per-class formatter hook, then the default
//! rules, then a last-resort stringification fallback.
//!
//! A known gotcha of the smallest-representable policy: a mapping keyed by
//! numeric values loses the key's declared width in transit, so a lookup
//! that was keyed by `long` on one side may probe with `byte` on the other.
//! Pin the width with a typed scalar when round-tripping mapping keys.

use std::{
    any::Any,
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use thiserror::Error;

use crate::{
    codec::{ElementKind, Value},
    shm::{self, ShmError},
    types::TypeId,
};

/// Minimum packed byte length before an array switches to shared memory.
pub const DEFAULT_SHM_THRESHOLD: usize = 8 * 1024;

/// Errors raised by coercion decisions.
#[derive(Debug, Error)]
pub enum CoerceError {
    /// Integer exceeds the widest wire integer type.
    #[error("integer {0} outside 64-bit signed range")]
    IntegerOverflow(i128),
    /// Shared-memory hand-off failed.
    #[error(transparent)]
    Shm(#[from] ShmError),
    /// The value has no wire representation.
    #[error("cannot represent value: {0}")]
    Unrepresentable(String),
}

/// Fit an untyped integer to its smallest representable wire type.
#[must_use]
pub fn fit_int(n: i64) -> Value {
    if let Ok(v) = i8::try_from(n) {
        Value::I8(v)
    } else if let Ok(v) = i16::try_from(n) {
        Value::I16(v)
    } else if let Ok(v) = i32::try_from(n) {
        Value::I32(v)
    } else {
        Value::I64(n)
    }
}

/// Fit an untyped integer that may exceed the 64-bit range.
///
/// # Errors
/// Returns [`CoerceError::IntegerOverflow`] when the value cannot be
/// carried by any wire integer type.
pub fn fit_big_int(n: i128) -> Result<Value, CoerceError> {
    i64::try_from(n)
        .map(fit_int)
        .map_err(|_| CoerceError::IntegerOverflow(n))
}

/// Untyped floats always travel as doubles.
#[must_use]
pub const fn fit_float(x: f64) -> Value { Value::F64(x) }

/// Widen a scalar wire value to the declared parameter type, without ever
/// narrowing. Boxing and unboxing are identity at the value level; the
/// distinction lives in the type system.
#[must_use]
pub fn convert_scalar(value: &Value, target: TypeId) -> Option<Value> {
    let target = target.unboxed().unwrap_or(target);
    match (value, target) {
        (Value::Bool(_), TypeId::BOOL) => Some(value.clone()),
        (Value::I8(v), TypeId::I8) => Some(Value::I8(*v)),
        (Value::I8(v), TypeId::I16) => Some(Value::I16(i16::from(*v))),
        (Value::I8(v), TypeId::I32) => Some(Value::I32(i32::from(*v))),
        (Value::I8(v), TypeId::I64) => Some(Value::I64(i64::from(*v))),
        (Value::I8(v), TypeId::F32) => Some(Value::F32(f32::from(*v))),
        (Value::I8(v), TypeId::F64) => Some(Value::F64(f64::from(*v))),
        (Value::I16(v), TypeId::I16) => Some(Value::I16(*v)),
        (Value::I16(v), TypeId::I32) => Some(Value::I32(i32::from(*v))),
        (Value::I16(v), TypeId::I64) => Some(Value::I64(i64::from(*v))),
        (Value::I16(v), TypeId::F32) => Some(Value::F32(f32::from(*v))),
        (Value::I16(v), TypeId::F64) => Some(Value::F64(f64::from(*v))),
        (Value::I32(v), TypeId::I32) => Some(Value::I32(*v)),
        (Value::I32(v), TypeId::I64) => Some(Value::I64(i64::from(*v))),
        #[allow(clippy::cast_precision_loss, reason = "widening past f32 is lossy by contract")]
        (Value::I32(v), TypeId::F32) => Some(Value::F32(*v as f32)),
        (Value::I32(v), TypeId::F64) => Some(Value::F64(f64::from(*v))),
        (Value::I64(v), TypeId::I64) => Some(Value::I64(*v)),
        #[allow(clippy::cast_precision_loss, reason = "widening past f32 is lossy by contract")]
        (Value::I64(v), TypeId::F32) => Some(Value::F32(*v as f32)),
        #[allow(clippy::cast_precision_loss, reason = "widening to double is lossy by contract")]
        (Value::I64(v), TypeId::F64) => Some(Value::F64(*v as f64)),
        (Value::F32(v), TypeId::F32) => Some(Value::F32(*v)),
        (Value::F32(v), TypeId::F64) => Some(Value::F64(f64::from(*v))),
        (Value::F64(v), TypeId::F64) => Some(Value::F64(*v)),
        _ => None,
    }
}

/// Pack 64-bit floats into big-endian element bytes.
#[must_use]
pub fn pack_f64(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Unpack big-endian element bytes into 64-bit floats.
#[must_use]
pub fn unpack_f64(data: &[u8]) -> Vec<f64> {
    data.chunks_exact(8)
        .map(|c| f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

/// Pack 64-bit integers into big-endian element bytes.
#[must_use]
pub fn pack_i64(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Unpack big-endian element bytes into 64-bit integers.
#[must_use]
pub fn unpack_i64(data: &[u8]) -> Vec<i64> {
    data.chunks_exact(8)
        .map(|c| i64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

/// Pack 32-bit integers into big-endian element bytes.
#[must_use]
pub fn pack_i32(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Unpack big-endian element bytes into 32-bit integers.
#[must_use]
pub fn unpack_i32(data: &[u8]) -> Vec<i32> {
    data.chunks_exact(4)
        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Shared-memory configuration for one session.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Directory backing the shared region.
    pub region: PathBuf,
    /// Packed byte length at which arrays switch to the region.
    pub threshold: usize,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            region: shm::default_region(),
            threshold: DEFAULT_SHM_THRESHOLD,
        }
    }
}

/// Per-class outbound formatter hook; returns `None` to fall through.
pub type FormatterHook =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Option<Value> + Send + Sync>;

/// Last-resort conversion: render the value for a remote string
/// constructor.
pub type FallbackHook =
    Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Option<String> + Send + Sync>;

/// Session-scoped coercion policy: shared-memory switch plus the
/// user-extensible hook chain.
#[derive(Default)]
pub struct Coercer {
    shm: Option<ShmConfig>,
    hooks: RwLock<HashMap<std::any::TypeId, FormatterHook>>,
    fallback: RwLock<Option<FallbackHook>>,
}

impl std::fmt::Debug for Coercer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coercer").field("shm", &self.shm).finish()
    }
}

impl Coercer {
    /// Coercer with the shared-memory path enabled.
    #[must_use]
    pub fn with_shm(config: ShmConfig) -> Self {
        Self {
            shm: Some(config),
            ..Self::default()
        }
    }

    /// Whether the shared-memory path is active.
    #[must_use]
    pub const fn shm_enabled(&self) -> bool { self.shm.is_some() }

    /// Register an outbound formatter for the concrete type `T`.
    pub fn register_hook<T: Any + Send + Sync>(&self, hook: FormatterHook) {
        self.hooks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(std::any::TypeId::of::<T>(), hook);
    }

    /// Install the last-resort stringification fallback.
    pub fn set_fallback(&self, hook: FallbackHook) {
        *self
            .fallback
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(hook);
    }

    /// Run the hook chain for an opaque native value.
    ///
    /// # Errors
    /// Returns [`CoerceError::Unrepresentable`] when no hook claims the
    /// value.
    pub fn coerce_opaque(&self, value: &(dyn Any + Send + Sync)) -> Result<Value, CoerceError> {
        let hooks = self
            .hooks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(hook) = hooks.get(&value.type_id()) {
            if let Some(v) = hook(value) {
                return Ok(v);
            }
        }
        drop(hooks);
        let fallback = self
            .fallback
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(hook) = fallback.as_ref() {
            if let Some(rendered) = hook(value) {
                return Ok(Value::Str(rendered));
            }
        }
        Err(CoerceError::Unrepresentable(
            "no formatter hook accepts this value".to_owned(),
        ))
    }

    /// Encode a packed homogeneous array, choosing inline bytes or the
    /// shared-memory path by size.
    ///
    /// # Errors
    /// Propagates shared-memory failures; the caller may retry inline.
    pub fn encode_array(&self, kind: ElementKind, data: Vec<u8>) -> Result<Value, CoerceError> {
        if let Some(cfg) = &self.shm {
            if data.len() >= cfg.threshold {
                let path = shm::write_array(&cfg.region, kind, &data)?;
                let len = (data.len() / kind.width().max(1)) as u64;
                return Ok(Value::ShmArray {
                    path: path.to_string_lossy().into_owned(),
                    kind,
                    len,
                });
            }
        }
        Ok(Value::Array { kind, data })
    }

    /// Materialise a received array value, draining the shared-memory file
    /// when one is referenced.
    ///
    /// # Errors
    /// Propagates shared-memory validation failures.
    pub fn receive_array(&self, value: Value) -> Result<(ElementKind, Vec<u8>), CoerceError> {
        match value {
            Value::Array { kind, data } => Ok((kind, data)),
            Value::ShmArray { path, kind, len } => {
                let data = shm::read_array(std::path::Path::new(&path), kind, len)?;
                Ok((kind, data))
            }
            other => Err(CoerceError::Unrepresentable(format!(
                "expected array value, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, Value::I8(0))]
    #[case(127, Value::I8(127))]
    #[case(128, Value::I16(128))]
    #[case(32_767, Value::I16(32_767))]
    #[case(32_768, Value::I32(32_768))]
    #[case(2_147_483_647, Value::I32(2_147_483_647))]
    #[case(2_147_483_648, Value::I64(2_147_483_648))]
    #[case(-128, Value::I8(-128))]
    #[case(-129, Value::I16(-129))]
    fn smallest_representable_fit(#[case] n: i64, #[case] expected: Value) {
        assert_eq!(fit_int(n), expected);
    }

    #[rstest]
    fn big_integer_overflow_fails() {
        assert!(matches!(
            fit_big_int(i128::from(i64::MAX) + 1),
            Err(CoerceError::IntegerOverflow(_))
        ));
        assert_eq!(fit_big_int(42).unwrap(), Value::I8(42));
    }

    #[rstest]
    fn widening_never_narrows() {
        assert_eq!(
            convert_scalar(&Value::I8(7), TypeId::I64),
            Some(Value::I64(7))
        );
        assert_eq!(
            convert_scalar(&Value::I8(7), TypeId::F64),
            Some(Value::F64(7.0))
        );
        assert_eq!(convert_scalar(&Value::I64(7), TypeId::I8), None);
        assert_eq!(convert_scalar(&Value::F64(1.5), TypeId::I64), None);
    }

    #[rstest]
    fn boxed_targets_unbox_first() {
        assert_eq!(
            convert_scalar(&Value::I32(3), TypeId::I64_BOX),
            Some(Value::I64(3))
        );
    }

    #[rstest]
    fn small_arrays_stay_inline() {
        let c = Coercer::with_shm(ShmConfig {
            region: std::env::temp_dir(),
            threshold: 1024,
        });
        let v = c.encode_array(ElementKind::I32, pack_i32(&[1, 2, 3])).unwrap();
        assert!(matches!(v, Value::Array { .. }));
    }

    #[rstest]
    fn large_arrays_go_through_shm() {
        let dir = tempfile::tempdir().unwrap();
        let c = Coercer::with_shm(ShmConfig {
            region: dir.path().to_path_buf(),
            threshold: 8,
        });
        let values: Vec<f64> = (0..10).map(f64::from).collect();
        let sent = c.encode_array(ElementKind::F64, pack_f64(&values)).unwrap();
        assert!(matches!(sent, Value::ShmArray { .. }));
        let (kind, data) = c.receive_array(sent).unwrap();
        assert_eq!(kind, ElementKind::F64);
        assert_eq!(unpack_f64(&data), values);
    }

    #[rstest]
    fn hook_chain_prefers_registered_formatter() {
        struct Money(u32);
        let c = Coercer::default();
        c.register_hook::<Money>(Arc::new(|v| {
            v.downcast_ref::<Money>().map(|m| Value::I64(i64::from(m.0)))
        }));
        let out = c.coerce_opaque(&Money(25)).unwrap();
        assert_eq!(out, Value::I64(25));
    }

    #[rstest]
    fn fallback_stringifies() {
        struct Odd;
        let c = Coercer::default();
        c.set_fallback(Arc::new(|_| Some("odd".to_owned())));
        assert_eq!(c.coerce_opaque(&Odd).unwrap(), Value::Str("odd".to_owned()));
    }
}
