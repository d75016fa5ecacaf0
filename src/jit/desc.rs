//! Calling conventions.
//!
//! Every method has a standard convention, where each parameter and return
//! is a reference, and may have an optimized one, where primitives travel
//! unboxed across one or more native slots. Falling back to the standard
//! convention is always legal.

use serde::Serialize;

use super::codebuf::NativeSignature;
use super::flavor::{JitFlavor, JitTypeDesc};
use super::insn::NativeClass;
use crate::error::JitError;
use crate::ir::{Constant, Parameter};
use crate::types::{Type, OBJECT};

/// One parameter or return value in one convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JitParamDesc {
    pub ty: Type,
    pub flavor: JitFlavor,
    pub class: NativeClass,
    /// Logical parameter or return index
    pub index: usize,
    /// Native parameter position, or the return carrier slot (-1 for the
    /// natural return)
    pub alt_index: i32,
    /// A trailing flag slot of a multi-slot value
    pub extension: bool,
}

impl JitParamDesc {
    fn new(ty: &Type, flavor: JitFlavor, class: NativeClass, index: usize, alt_index: i32) -> Self {
        Self {
            ty: ty.clone(),
            flavor,
            class,
            index,
            alt_index,
            extension: false,
        }
    }

    fn flag(ty: &Type, flavor: JitFlavor, index: usize, alt_index: i32) -> Self {
        Self {
            ty: ty.clone(),
            flavor,
            class: NativeClass::Boolean,
            index,
            alt_index,
            extension: true,
        }
    }
}

/// The standard and optimized entries for one formal type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JitParams {
    pub standard: Vec<JitParamDesc>,
    pub optimized: Option<Vec<JitParamDesc>>,
}

impl JitParams {
    /// Entries for a single required parameter at logical index 0.
    pub fn compute(desc: &JitTypeDesc) -> Self {
        let mut std_ix = 0;
        let mut opt_ix = 0;
        let (standard, optimized, is_optimized) = param_entries(desc, 0, None, &mut std_ix, &mut opt_ix);
        Self {
            standard,
            optimized: is_optimized.then_some(optimized),
        }
    }
}

/// Build the entries of one parameter, advancing the native positions.
fn param_entries(
    desc: &JitTypeDesc,
    index: usize,
    default: Option<&Constant>,
    std_ix: &mut i32,
    opt_ix: &mut i32,
) -> (Vec<JitParamDesc>, Vec<JitParamDesc>, bool) {
    let ty = &desc.ty;
    let has_default = default.is_some();
    let mut std = Vec::new();
    let mut opt = Vec::new();
    let mut optimized = false;

    let mut push_std = |std: &mut Vec<JitParamDesc>, flavor, class| {
        std.push(JitParamDesc::new(ty, flavor, class, index, *std_ix));
        *std_ix += 1;
    };
    let reference = |flavor: JitFlavor| if has_default { flavor.with_default() } else { flavor };

    match desc.flavor {
        JitFlavor::Primitive => {
            let boxed = boxed_class(ty);
            push_std(&mut std, reference(JitFlavor::Specific), boxed);
            optimized = true;
            if has_default {
                opt.push(JitParamDesc::new(ty, JitFlavor::PrimitiveWithDefault, desc.class.clone(), index, *opt_ix));
                opt.push(JitParamDesc::flag(ty, JitFlavor::PrimitiveWithDefault, index, *opt_ix + 1));
                *opt_ix += 2;
            } else {
                opt.push(JitParamDesc::new(ty, JitFlavor::Primitive, desc.class.clone(), index, *opt_ix));
                *opt_ix += 1;
            }
        }
        JitFlavor::MultiSlotPrimitive => {
            let widened = NativeClass::object(OBJECT);
            push_std(&mut std, reference(JitFlavor::Widened), widened.clone());
            match default {
                Some(Constant::Null) => {
                    opt.push(JitParamDesc::new(ty, JitFlavor::WidenedWithDefault, widened, index, *opt_ix));
                    *opt_ix += 1;
                }
                Some(_) => {
                    optimized = true;
                    let value = ty.remove_nullable();
                    opt.push(JitParamDesc::new(&value, JitFlavor::PrimitiveWithDefault, desc.class.clone(), index, *opt_ix));
                    opt.push(JitParamDesc::flag(&value, JitFlavor::PrimitiveWithDefault, index, *opt_ix + 1));
                    *opt_ix += 2;
                }
                None => {
                    optimized = true;
                    opt.push(JitParamDesc::new(ty, JitFlavor::MultiSlotPrimitive, desc.class.clone(), index, *opt_ix));
                    opt.push(JitParamDesc::flag(ty, JitFlavor::MultiSlotPrimitive, index, *opt_ix + 1));
                    *opt_ix += 2;
                }
            }
        }
        JitFlavor::XvmPrimitive => {
            push_std(&mut std, reference(JitFlavor::Specific), desc.class.clone());
            optimized = true;
            let flavor = if has_default {
                JitFlavor::XvmPrimitiveWithDefault
            } else {
                JitFlavor::XvmPrimitive
            };
            for word in &desc.slots {
                opt.push(JitParamDesc::new(ty, flavor, word.clone(), index, *opt_ix));
                *opt_ix += 1;
            }
            if has_default {
                opt.push(JitParamDesc::flag(ty, flavor, index, *opt_ix));
                *opt_ix += 1;
            }
        }
        JitFlavor::NullableXvmPrimitive => {
            let widened = NativeClass::object(OBJECT);
            push_std(&mut std, reference(JitFlavor::Widened), widened.clone());
            if has_default {
                opt.push(JitParamDesc::new(ty, JitFlavor::WidenedWithDefault, widened, index, *opt_ix));
                *opt_ix += 1;
            } else {
                optimized = true;
                for (i, slot) in desc.slots.iter().enumerate() {
                    let is_flag = i + 1 == desc.slots.len();
                    let entry = if is_flag {
                        JitParamDesc::flag(ty, JitFlavor::NullableXvmPrimitive, index, *opt_ix)
                    } else {
                        JitParamDesc::new(ty, JitFlavor::NullableXvmPrimitive, slot.clone(), index, *opt_ix)
                    };
                    opt.push(entry);
                    *opt_ix += 1;
                }
            }
        }
        JitFlavor::Widened => {
            push_std(&mut std, reference(JitFlavor::Widened), desc.class.clone());
            opt.push(JitParamDesc::new(ty, reference(JitFlavor::Widened), desc.class.clone(), index, *opt_ix));
            *opt_ix += 1;
        }
        _ => {
            push_std(&mut std, reference(JitFlavor::Specific), desc.class.clone());
            opt.push(JitParamDesc::new(ty, reference(JitFlavor::Specific), desc.class.clone(), index, *opt_ix));
            *opt_ix += 1;
        }
    }
    (std, opt, optimized)
}

fn boxed_class(ty: &Type) -> NativeClass {
    match ty.single_class() {
        Some(name) => NativeClass::object(name),
        None => NativeClass::object(OBJECT),
    }
}

/// Kind of routine, which decides the implicit leading parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MethodKind {
    /// `(ctx, ...)`
    Function,
    /// `(ctx, this, ...)`
    Method,
    /// `(ctx, ctorCtx, [type], this, ...)`
    Constructor { add_ctor_ctx: bool, add_type: bool },
}

/// The full calling convention of a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JitMethodDesc {
    pub kind: MethodKind,
    pub standard_params: Vec<JitParamDesc>,
    pub standard_returns: Vec<JitParamDesc>,
    pub optimized_params: Option<Vec<JitParamDesc>>,
    pub optimized_returns: Option<Vec<JitParamDesc>>,
    pub standard_signature: NativeSignature,
    pub optimized_signature: Option<NativeSignature>,
}

impl JitMethodDesc {
    /// Compute both conventions for a signature. `classify` supplies the
    /// (memoized) type classification of the owning type system.
    pub fn of(
        params: &[Parameter],
        returns: &[Type],
        kind: MethodKind,
        classify: impl Fn(&Type) -> JitTypeDesc,
    ) -> Self {
        let mut standard_params = Vec::with_capacity(params.len());
        let mut optimized_params = Vec::with_capacity(params.len());
        let mut params_optimized = false;
        let mut std_ix = 0;
        let mut opt_ix = 0;
        for (i, param) in params.iter().enumerate() {
            let desc = classify(&param.ty);
            let (std, opt, optimized) =
                param_entries(&desc, i, param.default.as_ref(), &mut std_ix, &mut opt_ix);
            standard_params.extend(std);
            optimized_params.extend(opt);
            params_optimized |= optimized;
        }

        let mut standard_returns = Vec::with_capacity(returns.len());
        let mut optimized_returns = Vec::with_capacity(returns.len());
        let mut returns_optimized = false;
        // Carrier counters; -1 is the natural return.
        let mut ix_long: i32 = -1;
        let mut ix_opt_obj: i32 = -1;
        let mut ix_std_obj: i32 = -1;
        for (i, ty) in returns.iter().enumerate() {
            let desc = classify(ty);
            match desc.flavor {
                JitFlavor::Primitive => {
                    returns_optimized = true;
                    standard_returns.push(JitParamDesc::new(ty, JitFlavor::Specific, boxed_class(ty), i, ix_std_obj));
                    ix_std_obj += 1;
                    optimized_returns.push(JitParamDesc::new(ty, JitFlavor::Primitive, desc.class.clone(), i, ix_long));
                    ix_long += 1;
                }
                JitFlavor::MultiSlotPrimitive => {
                    returns_optimized = true;
                    standard_returns.push(JitParamDesc::new(ty, JitFlavor::Widened, NativeClass::object(OBJECT), i, ix_std_obj));
                    ix_std_obj += 1;
                    optimized_returns.push(JitParamDesc::new(ty, JitFlavor::MultiSlotPrimitive, desc.class.clone(), i, ix_long));
                    ix_long += 1;
                    optimized_returns.push(JitParamDesc::flag(ty, JitFlavor::MultiSlotPrimitive, i, ix_long));
                    ix_long += 1;
                }
                JitFlavor::XvmPrimitive | JitFlavor::NullableXvmPrimitive => {
                    returns_optimized = true;
                    let std_flavor = if desc.flavor == JitFlavor::XvmPrimitive {
                        JitFlavor::Specific
                    } else {
                        JitFlavor::Widened
                    };
                    let std_class = if std_flavor == JitFlavor::Specific {
                        desc.class.clone()
                    } else {
                        NativeClass::object(OBJECT)
                    };
                    standard_returns.push(JitParamDesc::new(ty, std_flavor, std_class, i, ix_std_obj));
                    ix_std_obj += 1;
                    let last = desc.slots.len() - 1;
                    for (w, slot) in desc.slots.iter().enumerate() {
                        let entry = if desc.flavor == JitFlavor::NullableXvmPrimitive && w == last {
                            JitParamDesc::flag(ty, desc.flavor, i, ix_long)
                        } else {
                            JitParamDesc::new(ty, desc.flavor, slot.clone(), i, ix_long)
                        };
                        optimized_returns.push(entry);
                        ix_long += 1;
                    }
                }
                flavor => {
                    let flavor = if flavor == JitFlavor::Widened {
                        JitFlavor::Widened
                    } else {
                        JitFlavor::Specific
                    };
                    standard_returns.push(JitParamDesc::new(ty, flavor, desc.class.clone(), i, ix_std_obj));
                    ix_std_obj += 1;
                    optimized_returns.push(JitParamDesc::new(ty, flavor, desc.class.clone(), i, ix_opt_obj));
                    ix_opt_obj += 1;
                }
            }
            // Only the first value returns natively.
            if ix_long == -1 {
                ix_long = 0;
            }
            if ix_opt_obj == -1 {
                ix_opt_obj = 0;
            }
        }

        let is_optimized = params_optimized || returns_optimized;
        let standard_signature = signature(kind, &standard_params, &standard_returns);
        let (optimized_params, optimized_returns, optimized_signature) = if is_optimized {
            let sig = signature(kind, &optimized_params, &optimized_returns);
            (Some(optimized_params), Some(optimized_returns), Some(sig))
        } else {
            (None, None, None)
        };

        Self {
            kind,
            standard_params,
            standard_returns,
            optimized_params,
            optimized_returns,
            standard_signature,
            optimized_signature,
        }
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized_params.is_some() && self.optimized_returns.is_some()
    }

    /// Number of implicit leading native parameters.
    pub fn implicit_param_count(&self) -> usize {
        match self.kind {
            MethodKind::Function => 1,
            MethodKind::Method => 2,
            MethodKind::Constructor {
                add_ctor_ctx,
                add_type,
            } => 2 + add_ctor_ctx as usize + add_type as usize,
        }
    }

    /// The native slot of the receiver, if the routine has one.
    pub fn this_slot(&self) -> Option<usize> {
        match self.kind {
            MethodKind::Function => None,
            _ => Some(self.implicit_param_count() - 1),
        }
    }

    /// Parameters of the chosen convention.
    pub fn params(&self, optimized: bool) -> &[JitParamDesc] {
        match (&self.optimized_params, optimized) {
            (Some(params), true) => params,
            _ => &self.standard_params,
        }
    }

    pub fn returns(&self, optimized: bool) -> &[JitParamDesc] {
        match (&self.optimized_returns, optimized) {
            (Some(returns), true) => returns,
            _ => &self.standard_returns,
        }
    }

    pub fn signature(&self, optimized: bool) -> &NativeSignature {
        match (&self.optimized_signature, optimized) {
            (Some(sig), true) => sig,
            _ => &self.standard_signature,
        }
    }

    pub fn standard_signature(&self) -> &NativeSignature {
        &self.standard_signature
    }

    pub fn optimized_signature(&self) -> Option<&NativeSignature> {
        self.optimized_signature.as_ref()
    }

    fn optimized_params_or_err(&self, index: usize) -> Result<&[JitParamDesc], JitError> {
        self.optimized_params
            .as_deref()
            .ok_or(JitError::InvalidIndex { what: "optimized parameter", index })
    }

    fn optimized_returns_or_err(&self, index: usize) -> Result<&[JitParamDesc], JitError> {
        self.optimized_returns
            .as_deref()
            .ok_or(JitError::InvalidIndex { what: "optimized return", index })
    }

    /// Position in the optimized parameter list of the first entry for a
    /// logical argument.
    pub fn get_optimized_param_index(&self, arg_index: usize) -> Result<usize, JitError> {
        self.optimized_params_or_err(arg_index)?
            .iter()
            .position(|p| p.index == arg_index)
            .ok_or(JitError::InvalidIndex { what: "optimized parameter", index: arg_index })
    }

    pub fn get_optimized_param(&self, arg_index: usize) -> Result<&JitParamDesc, JitError> {
        let ix = self.get_optimized_param_index(arg_index)?;
        Ok(&self.optimized_params_or_err(arg_index)?[ix])
    }

    /// Positions of every optimized entry of a logical argument.
    pub fn get_all_optimized_params(&self, arg_index: usize) -> Result<Vec<usize>, JitError> {
        let all: Vec<usize> = self
            .optimized_params_or_err(arg_index)?
            .iter()
            .enumerate()
            .filter(|(_, p)| p.index == arg_index)
            .map(|(i, _)| i)
            .collect();
        if all.is_empty() {
            return Err(JitError::InvalidIndex { what: "optimized parameter", index: arg_index });
        }
        Ok(all)
    }

    pub fn get_optimized_return_index(&self, ret_index: usize) -> Result<usize, JitError> {
        self.optimized_returns_or_err(ret_index)?
            .iter()
            .position(|r| r.index == ret_index)
            .ok_or(JitError::InvalidIndex { what: "optimized return", index: ret_index })
    }

    pub fn get_all_optimized_return_indexes(&self, ret_index: usize) -> Result<Vec<usize>, JitError> {
        let all: Vec<usize> = self
            .optimized_returns_or_err(ret_index)?
            .iter()
            .enumerate()
            .filter(|(_, r)| r.index == ret_index)
            .map(|(i, _)| i)
            .collect();
        if all.is_empty() {
            return Err(JitError::InvalidIndex { what: "optimized return", index: ret_index });
        }
        Ok(all)
    }
}

fn signature(kind: MethodKind, params: &[JitParamDesc], returns: &[JitParamDesc]) -> NativeSignature {
    let mut classes = vec![NativeClass::object("Ctx")];
    match kind {
        MethodKind::Function => {}
        MethodKind::Method => classes.push(NativeClass::object(OBJECT)),
        MethodKind::Constructor {
            add_ctor_ctx,
            add_type,
        } => {
            if add_ctor_ctx {
                classes.push(NativeClass::object("CtorCtx"));
            }
            if add_type {
                classes.push(NativeClass::object("Type"));
            }
            classes.push(NativeClass::object(OBJECT));
        }
    }
    classes.extend(params.iter().map(|p| p.class.clone()));
    NativeSignature {
        params: classes,
        ret: returns.first().map(|r| r.class.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::flavor::classify;

    fn ty(s: &str) -> Type {
        s.parse().unwrap()
    }

    fn param(name: &str, t: &str, default: Option<Constant>) -> Parameter {
        Parameter {
            name: name.to_string(),
            ty: ty(t),
            default,
        }
    }

    fn describe(params: &[Parameter], returns: &[&str]) -> JitMethodDesc {
        let returns: Vec<Type> = returns.iter().map(|r| ty(r)).collect();
        JitMethodDesc::of(params, &returns, MethodKind::Function, |t| classify(t, true))
    }

    #[test]
    fn test_compute_primitive() {
        let params = JitParams::compute(&classify(&ty("Int64"), true));
        assert_eq!(params.standard.len(), 1);
        assert_eq!(params.standard[0].flavor, JitFlavor::Specific);
        let opt = params.optimized.unwrap();
        assert_eq!(opt.len(), 1);
        assert_eq!(opt[0].class, NativeClass::Long);
        assert_eq!(opt[0].alt_index, 0);
    }

    #[test]
    fn test_compute_nullable_and_wide() {
        let params = JitParams::compute(&classify(&ty("Int32?"), true));
        let opt = params.optimized.unwrap();
        assert_eq!(opt.len(), 2);
        assert!(!opt[0].extension);
        assert!(opt[1].extension);

        let params = JitParams::compute(&classify(&ty("Int128"), true));
        let opt = params.optimized.unwrap();
        assert_eq!(opt.len(), 2);
        assert_eq!(opt[0].index, opt[1].index);
        assert_eq!((opt[0].alt_index, opt[1].alt_index), (0, 1));
    }

    #[test]
    fn test_compute_reference_is_standard_only() {
        let params = JitParams::compute(&classify(&ty("String"), true));
        assert!(params.optimized.is_none());
    }

    #[test]
    fn test_method_with_default_boolean() {
        let d = describe(&[param("flag", "Boolean?", Some(Constant::Bool(true)))], &[]);
        assert!(d.is_optimized());
        let opt = d.optimized_params.as_ref().unwrap();
        assert_eq!(opt.len(), 2);
        assert_eq!(opt[0].flavor, JitFlavor::PrimitiveWithDefault);
        assert_eq!(opt[1].class, NativeClass::Boolean);
        assert_eq!(d.get_all_optimized_params(0).unwrap(), vec![0, 1]);
        let sig = d.optimized_signature().unwrap();
        assert_eq!(sig.params.len() - d.implicit_param_count(), 2);
        assert_eq!(d.standard_params[0].flavor, JitFlavor::WidenedWithDefault);
    }

    #[test]
    fn test_null_default_stays_standard() {
        let d = describe(&[param("x", "Int64?", Some(Constant::Null))], &[]);
        assert!(!d.is_optimized());
        assert!(d.get_optimized_param(0).is_err());
    }

    #[test]
    fn test_return_carriers() {
        let d = describe(&[], &["Int64", "String", "Int32?", "Int128"]);
        let opt = d.optimized_returns.as_ref().unwrap();
        // Int64 natural; String in the object carrier; the rest in longs.
        assert_eq!(opt[0].alt_index, -1);
        assert_eq!(opt[1].alt_index, 0);
        assert_eq!(opt[1].class, NativeClass::object("String"));
        assert_eq!((opt[2].alt_index, opt[3].alt_index), (0, 1));
        assert!(opt[3].extension);
        assert_eq!((opt[4].alt_index, opt[5].alt_index), (2, 3));
        let std: Vec<i32> = d.standard_returns.iter().map(|r| r.alt_index).collect();
        assert_eq!(std, vec![-1, 0, 1, 2]);
        assert_eq!(d.get_all_optimized_return_indexes(3).unwrap(), vec![4, 5]);
        assert!(d.get_optimized_return_index(9).is_err());
    }

    #[test]
    fn test_natural_nullable_return() {
        let d = describe(&[], &["Int32?"]);
        let opt = d.optimized_returns.as_ref().unwrap();
        assert_eq!((opt[0].alt_index, opt[1].alt_index), (-1, 0));
    }

    #[test]
    fn test_implicit_params() {
        let f = JitMethodDesc::of(&[], &[], MethodKind::Function, |t| classify(t, true));
        assert_eq!(f.implicit_param_count(), 1);
        assert_eq!(f.this_slot(), None);
        let c = JitMethodDesc::of(
            &[],
            &[],
            MethodKind::Constructor { add_ctor_ctx: true, add_type: false },
            |t| classify(t, true),
        );
        assert_eq!(c.implicit_param_count(), 3);
        assert_eq!(c.this_slot(), Some(2));
        assert_eq!(c.standard_signature().params.len(), 3);
        assert_eq!(c.standard_signature().ret, None);
    }

    #[test]
    fn test_unoptimized_type_system() {
        let d = JitMethodDesc::of(
            &[param("x", "Int64", None)],
            &[ty("Int64")],
            MethodKind::Function,
            |t| classify(t, false),
        );
        assert!(!d.is_optimized());
        assert_eq!(d.params(true), d.standard_params.as_slice());
    }
}
