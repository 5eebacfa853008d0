//=====================================================
// File: host/overload.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Host overload resolution
// Objective: Rank host descriptors against runtime argument types, bind generic
//            parameters, coerce primitives, and fail loudly on ambiguity
//=====================================================

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use once_cell::sync::Lazy;

use super::{HostCall, HostFunction, TypeRef};
use crate::error::RuntimeFault;
use crate::vm::value::Value;

/// Implicit primitive conversions and their priority (lower wins).
static PRIMITIVE_CONVERSIONS: Lazy<HashMap<(&'static str, &'static str), u32>> = Lazy::new(|| {
    HashMap::from([
        (("int", "i32"), 1),
        (("int", "float"), 2),
        (("int", "f32"), 3),
        (("float", "f32"), 1),
    ])
});

/// Source of inheritance information for upcast matching.
pub trait TypeHierarchy {
    /// Ancestors of `type_name`, direct base first.
    fn base_chain(&self, type_name: &str) -> Vec<TypeRef>;
}

/// Match categories from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchCategory {
    Exact,
    Nullable,
    Generic,
    Primitive,
    Upcast,
    GenericUpcast,
    Any,
}

/// Distance between one argument and one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamMatch {
    pub category: MatchCategory,
    pub score: u32,
}

impl ParamMatch {
    fn new(category: MatchCategory, score: u32) -> Self {
        Self { category, score }
    }

    /// `Greater` when `self` is the better match.
    pub fn compare(&self, other: &ParamMatch) -> Ordering {
        match other.category.cmp(&self.category) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        match self.category {
            // More concrete generic matches win.
            MatchCategory::Generic => self.score.cmp(&other.score),
            // Conversion priority and inheritance depth: lower wins.
            MatchCategory::Primitive | MatchCategory::Upcast | MatchCategory::GenericUpcast => {
                other.score.cmp(&self.score)
            }
            _ => Ordering::Equal,
        }
    }
}

/// A selected overload with its prepared call.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub function: Rc<HostFunction>,
    pub call: HostCall,
}

struct Candidate {
    function: Rc<HostFunction>,
    matches: Vec<ParamMatch>,
    bindings: BTreeMap<String, TypeRef>,
}

struct Matcher<'a> {
    hierarchy: &'a dyn TypeHierarchy,
    bindings: BTreeMap<String, TypeRef>,
}

impl Matcher<'_> {
    fn match_type(&mut self, actual: &TypeRef, param: &TypeRef) -> Option<ParamMatch> {
        match param {
            TypeRef::Any => Some(ParamMatch::new(MatchCategory::Any, 0)),
            TypeRef::Nullable(inner) => {
                if is_unit(actual) {
                    return Some(ParamMatch::new(MatchCategory::Nullable, 0));
                }
                let inner_match = self.match_type(actual, inner)?;
                if inner_match.category == MatchCategory::Exact {
                    Some(ParamMatch::new(MatchCategory::Nullable, 0))
                } else {
                    Some(inner_match)
                }
            }
            TypeRef::Generic(name) => {
                if is_unit(actual) {
                    return None;
                }
                match self.bindings.get(name) {
                    Some(bound) if bound != actual => None,
                    Some(_) => Some(ParamMatch::new(MatchCategory::Generic, 0)),
                    None => {
                        self.bindings.insert(name.clone(), actual.clone());
                        Some(ParamMatch::new(MatchCategory::Generic, 0))
                    }
                }
            }
            TypeRef::Named(expected) => self.match_named(actual, expected),
            TypeRef::Instance { base, args } => self.match_instance(actual, base, args, param),
        }
    }

    fn match_named(&mut self, actual: &TypeRef, expected: &str) -> Option<ParamMatch> {
        if let TypeRef::Named(name) = actual {
            if name == expected {
                return Some(ParamMatch::new(MatchCategory::Exact, 0));
            }
            if let Some(priority) = PRIMITIVE_CONVERSIONS.get(&(name.as_str(), expected)) {
                return Some(ParamMatch::new(MatchCategory::Primitive, *priority));
            }
        }
        let actual_name = actual.base_name()?;
        self.hierarchy
            .base_chain(actual_name)
            .iter()
            .position(|ancestor| matches!(ancestor, TypeRef::Named(name) if name == expected))
            .map(|index| ParamMatch::new(MatchCategory::Upcast, index as u32 + 1))
    }

    fn match_instance(
        &mut self,
        actual: &TypeRef,
        base: &str,
        args: &[TypeRef],
        param: &TypeRef,
    ) -> Option<ParamMatch> {
        if let TypeRef::Instance {
            base: actual_base,
            args: actual_args,
        } = actual
            && actual_base == base
        {
            let all_exact = self.match_type_args(actual_args, args)?;
            return Some(if all_exact {
                ParamMatch::new(MatchCategory::Exact, 0)
            } else {
                ParamMatch::new(MatchCategory::Generic, concreteness(param))
            });
        }

        let actual_name = actual.base_name()?;
        let chain = self.hierarchy.base_chain(actual_name);
        for (index, ancestor) in chain.iter().enumerate() {
            if let TypeRef::Instance {
                base: ancestor_base,
                args: ancestor_args,
            } = ancestor
                && ancestor_base == base
            {
                self.match_type_args(ancestor_args, args)?;
                return Some(ParamMatch::new(
                    MatchCategory::GenericUpcast,
                    index as u32 + 1,
                ));
            }
        }
        None
    }

    /// Type arguments are invariant: each must match exactly or bind a generic.
    /// Returns whether every argument matched exactly.
    fn match_type_args(&mut self, actual: &[TypeRef], expected: &[TypeRef]) -> Option<bool> {
        if actual.len() != expected.len() {
            return None;
        }
        let mut all_exact = true;
        for (actual, expected) in actual.iter().zip(expected) {
            let matched = self.match_type(actual, expected)?;
            match matched.category {
                MatchCategory::Exact => {}
                MatchCategory::Generic => all_exact = false,
                _ => return None,
            }
        }
        Some(all_exact)
    }
}

fn is_unit(ty: &TypeRef) -> bool {
    matches!(ty, TypeRef::Named(name) if name == "unit")
}

/// Number of concrete nodes in a parameter type.
fn concreteness(ty: &TypeRef) -> u32 {
    match ty {
        TypeRef::Any | TypeRef::Generic(_) => 0,
        TypeRef::Named(_) => 1,
        TypeRef::Nullable(inner) => concreteness(inner),
        TypeRef::Instance { args, .. } => 1 + args.iter().map(concreteness).sum::<u32>(),
    }
}

fn evaluate(
    function: &Rc<HostFunction>,
    args: &[Value],
    hierarchy: &dyn TypeHierarchy,
) -> Option<Candidate> {
    let params = function.params();
    if args.len() < function.required() || args.len() > params.len() {
        return None;
    }
    let mut matcher = Matcher {
        hierarchy,
        bindings: BTreeMap::new(),
    };
    let mut matches = Vec::with_capacity(args.len());
    for (arg, param) in args.iter().zip(params) {
        if matches!(arg, Value::UseDefault) && param.optional {
            matches.push(ParamMatch::new(MatchCategory::Exact, 0));
            continue;
        }
        matches.push(matcher.match_type(&arg.runtime_type(), &param.ty)?);
    }
    Some(Candidate {
        function: Rc::clone(function),
        matches,
        bindings: matcher.bindings,
    })
}

/// Sum of per-parameter comparisons; positive when `lhs` is the better candidate.
fn compare(lhs: &Candidate, rhs: &Candidate) -> i32 {
    lhs.matches
        .iter()
        .zip(&rhs.matches)
        .map(|(a, b)| match a.compare(b) {
            Ordering::Greater => 1,
            Ordering::Less => -1,
            Ordering::Equal => 0,
        })
        .sum()
}

/// Picks the best descriptor among `candidates` for `args`.
pub fn resolve(
    name: &str,
    candidates: &[Rc<HostFunction>],
    args: Vec<Value>,
    hierarchy: &dyn TypeHierarchy,
) -> Result<Resolved, RuntimeFault> {
    let mut viable: Vec<Candidate> = candidates
        .iter()
        .filter_map(|function| evaluate(function, &args, hierarchy))
        .collect();

    if viable.is_empty() {
        return Err(RuntimeFault::NoMatchingOverload {
            name: name.to_string(),
            arguments: args.iter().map(|arg| arg.runtime_type().to_string()).collect(),
        });
    }

    let mut best = 0;
    for index in 1..viable.len() {
        if compare(&viable[best], &viable[index]) < 0 {
            best = index;
        }
    }

    // The winner must beat every other candidate outright.
    let rivals: Vec<String> = viable
        .iter()
        .enumerate()
        .filter(|(index, candidate)| *index != best && compare(&viable[best], candidate) <= 0)
        .map(|(_, candidate)| candidate.function.describe())
        .collect();
    if !rivals.is_empty() {
        let mut names = vec![viable[best].function.describe()];
        names.extend(rivals);
        return Err(RuntimeFault::AmbiguousOverload {
            name: name.to_string(),
            candidates: names,
        });
    }

    let winner = viable.swap_remove(best);
    Ok(prepare(winner, args))
}

/// Coerces primitives to the selected parameter types and pads omitted optionals.
fn prepare(candidate: Candidate, mut args: Vec<Value>) -> Resolved {
    let params = candidate.function.params();
    for (index, matched) in candidate.matches.iter().enumerate() {
        if matched.category != MatchCategory::Primitive {
            continue;
        }
        let target = params[index].ty.base_name();
        if let (Some("float" | "f32"), Value::Int(value)) = (target, &args[index]) {
            args[index] = Value::Float(*value as f64);
        }
    }
    while args.len() < params.len() {
        args.push(Value::UseDefault);
    }
    Resolved {
        function: candidate.function,
        call: HostCall {
            args,
            type_args: candidate.bindings,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flat;

    impl TypeHierarchy for Flat {
        fn base_chain(&self, _type_name: &str) -> Vec<TypeRef> {
            Vec::new()
        }
    }

    struct Animals;

    impl TypeHierarchy for Animals {
        fn base_chain(&self, type_name: &str) -> Vec<TypeRef> {
            match type_name {
                "Dog" => vec![TypeRef::named("Mammal"), TypeRef::named("Animal")],
                "Mammal" => vec![TypeRef::named("Animal")],
                "IntList" => vec![TypeRef::instance("List", vec![TypeRef::int()])],
                _ => Vec::new(),
            }
        }
    }

    fn overload(tag: i64, params: Vec<TypeRef>) -> Rc<HostFunction> {
        Rc::new(HostFunction::new("f", params, move |_| Ok(Value::Int(tag))))
    }

    fn pick(candidates: &[Rc<HostFunction>], args: Vec<Value>) -> Result<i64, RuntimeFault> {
        pick_in(&Flat, candidates, args)
    }

    fn pick_in(
        hierarchy: &dyn TypeHierarchy,
        candidates: &[Rc<HostFunction>],
        args: Vec<Value>,
    ) -> Result<i64, RuntimeFault> {
        let resolved = resolve("f", candidates, args, hierarchy)?;
        let value = resolved.function.call(&resolved.call).expect("call");
        Ok(value.as_int().expect("tag"))
    }

    #[test]
    fn exact_beats_primitive_conversion() {
        let candidates = [
            overload(1, vec![TypeRef::int(), TypeRef::int()]),
            overload(2, vec![TypeRef::int(), TypeRef::float()]),
        ];
        assert_eq!(pick(&candidates, vec![Value::Int(1), Value::Int(2)]), Ok(1));
        assert_eq!(pick(&candidates, vec![Value::Int(1), Value::Float(2.0)]), Ok(2));
    }

    #[test]
    fn conversion_table_orders_primitive_matches() {
        let candidates = [
            overload(1, vec![TypeRef::named("f32")]),
            overload(2, vec![TypeRef::float()]),
            overload(3, vec![TypeRef::named("i32")]),
        ];
        assert_eq!(pick(&candidates, vec![Value::Int(7)]), Ok(3));
        assert_eq!(pick(&candidates[..2], vec![Value::Int(7)]), Ok(2));
    }

    #[test]
    fn equal_rank_candidates_are_ambiguous() {
        let candidates = [overload(1, vec![TypeRef::Any]), overload(2, vec![TypeRef::Any])];
        let error = pick(&candidates, vec![Value::Int(1)]).expect_err("ambiguous");
        match error {
            RuntimeFault::AmbiguousOverload { name, candidates } => {
                assert_eq!(name, "f");
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("unexpected fault {other:?}"),
        }
    }

    #[test]
    fn crossed_conversions_cancel_out_into_ambiguity() {
        let candidates = [
            overload(1, vec![TypeRef::int(), TypeRef::float()]),
            overload(2, vec![TypeRef::float(), TypeRef::int()]),
        ];
        let error = pick(&candidates, vec![Value::Int(1), Value::Int(2)]).expect_err("ambiguous");
        assert!(matches!(error, RuntimeFault::AmbiguousOverload { .. }));
    }

    #[test]
    fn arity_window_admits_optional_parameters() {
        let candidates = [Rc::new(
            HostFunction::new("f", vec![TypeRef::int()], |call| {
                Ok(Value::Bool(call.is_default(1)))
            })
            .with_optional(TypeRef::int()),
        )];
        let resolved = resolve("f", &candidates, vec![Value::Int(1)], &Flat).expect("resolved");
        assert_eq!(resolved.call.args, vec![Value::Int(1), Value::UseDefault]);
        assert_eq!(
            resolved.function.call(&resolved.call).expect("call"),
            Value::Bool(true)
        );
        assert!(matches!(
            resolve("f", &candidates, vec![], &Flat),
            Err(RuntimeFault::NoMatchingOverload { .. })
        ));
    }

    #[test]
    fn nullable_accepts_unit_and_ranks_below_exact() {
        let candidates = [
            overload(1, vec![TypeRef::nullable(TypeRef::int())]),
            overload(2, vec![TypeRef::int()]),
        ];
        assert_eq!(pick(&candidates, vec![Value::Int(1)]), Ok(2));
        assert_eq!(pick(&candidates, vec![Value::Unit]), Ok(1));
    }

    #[test]
    fn shallower_upcast_wins() {
        let candidates = [
            overload(1, vec![TypeRef::named("Animal")]),
            overload(2, vec![TypeRef::named("Mammal")]),
        ];
        let dog = Value::object(crate::host::HostObject::new("Dog"));
        assert_eq!(pick_in(&Animals, &candidates, vec![dog]), Ok(2));
    }

    #[test]
    fn generic_parameters_bind_consistently() {
        let candidates = [Rc::new(HostFunction::new(
            "f",
            vec![TypeRef::generic("T"), TypeRef::generic("T")],
            |call| Ok(Value::string(call.type_arg("T").expect("bound").to_string())),
        ))];
        let resolved =
            resolve("f", &candidates, vec![Value::Int(1), Value::Int(2)], &Flat).expect("bound");
        assert_eq!(resolved.call.type_args.get("T"), Some(&TypeRef::int()));
        assert!(resolve("f", &candidates, vec![Value::Int(1), Value::string("x")], &Flat).is_err());
    }

    #[test]
    fn more_concrete_generic_wins() {
        let list = || {
            Value::object(
                crate::host::HostObject::new("List").with_type_args(vec![TypeRef::int()]),
            )
        };
        let candidates = [
            overload(1, vec![TypeRef::generic("T")]),
            overload(2, vec![TypeRef::instance("List", vec![TypeRef::generic("T")])]),
        ];
        assert_eq!(pick(&candidates, vec![list()]), Ok(2));
    }

    #[test]
    fn generic_upcast_matches_instantiated_base() {
        let candidates = [
            overload(1, vec![TypeRef::Any]),
            overload(2, vec![TypeRef::instance("List", vec![TypeRef::generic("T")])]),
        ];
        let value = Value::object(crate::host::HostObject::new("IntList"));
        assert_eq!(pick_in(&Animals, &candidates, vec![value]), Ok(2));
    }

    #[test]
    fn primitive_match_coerces_argument() {
        let candidates = [Rc::new(HostFunction::new("f", vec![TypeRef::float()], |call| {
            Ok(call.arg(0)?.clone())
        }))];
        let resolved = resolve("f", &candidates, vec![Value::Int(3)], &Flat).expect("resolved");
        assert!(matches!(resolved.call.args[0], Value::Float(v) if v == 3.0));
    }
}

//=====================================================
// End of file
//=====================================================
