//! Signaling expressions.
//!
//! A signal's aspects are computed by a small typed expression language over
//! route and signal states. Expressions arrive as [`ExprSpec`] trees that
//! refer to entities by name; they are resolved once into [`Expr`] trees that
//! refer to entities by id and are type-checked at the same time, so
//! evaluation never meets an unknown name or an ill-typed operand.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{SimulationError, ValidationError};
use crate::id::*;
use crate::interlocking::RouteStatus;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// The set of aspects a signal shows.
pub type AspectSet = BTreeSet<AspectId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    AspectSet,
    Signal,
    Route,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    AspectSet(AspectSet),
    Signal(SignalId),
    Route(RouteId),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::AspectSet(_) => ValueType::AspectSet,
            Value::Signal(_) => ValueType::Signal,
            Value::Route(_) => ValueType::Route,
        }
    }

    fn mismatch(&self, expected: ValueType) -> SimulationError {
        SimulationError::ExprTypeMismatch {
            expected,
            found: self.value_type(),
        }
    }

    pub fn into_bool(self) -> Result<bool, SimulationError> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(other.mismatch(ValueType::Bool)),
        }
    }

    pub fn into_aspect_set(self) -> Result<AspectSet, SimulationError> {
        match self {
            Value::AspectSet(set) => Ok(set),
            other => Err(other.mismatch(ValueType::AspectSet)),
        }
    }

    fn into_signal(self) -> Result<SignalId, SimulationError> {
        match self {
            Value::Signal(id) => Ok(id),
            other => Err(other.mismatch(ValueType::Signal)),
        }
    }

    fn into_route(self) -> Result<RouteId, SimulationError> {
        match self {
            Value::Route(id) => Ok(id),
            other => Err(other.mismatch(ValueType::Route)),
        }
    }
}

/// Read access to the interlocking state an expression depends on.
pub trait SignalingState {
    fn route_status(&self, route: RouteId) -> RouteStatus;
    fn signal_aspects(&self, signal: SignalId) -> &AspectSet;
}

// ---------------------------------------------------------------------------
// Unresolved expressions
// ---------------------------------------------------------------------------

/// An expression as written, referring to entities by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprSpec {
    Bool(bool),
    And(Vec<ExprSpec>),
    Or(Vec<ExprSpec>),
    Not(Box<ExprSpec>),
    If {
        condition: Box<ExprSpec>,
        then: Box<ExprSpec>,
        otherwise: Box<ExprSpec>,
    },
    /// Builds a set from the aspects whose condition holds.
    AspectSet(Vec<AspectSetMemberSpec>),
    /// True if the set holds any of the listed aspects.
    AspectSetContains {
        set: Box<ExprSpec>,
        aspects: Vec<String>,
    },
    SignalAspects(Box<ExprSpec>),
    RouteStateIs {
        route: Box<ExprSpec>,
        status: RouteStatus,
    },
    Signal(String),
    Route(String),
    Arg(String),
    Call {
        function: String,
        args: Vec<ExprSpec>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectSetMemberSpec {
    pub aspect: String,
    pub condition: Option<ExprSpec>,
}

impl ExprSpec {
    pub fn signal(name: &str) -> Self {
        ExprSpec::Signal(name.to_string())
    }

    pub fn route(name: &str) -> Self {
        ExprSpec::Route(name.to_string())
    }

    pub fn arg(name: &str) -> Self {
        ExprSpec::Arg(name.to_string())
    }

    pub fn not(inner: ExprSpec) -> Self {
        ExprSpec::Not(Box::new(inner))
    }

    pub fn if_else(condition: ExprSpec, then: ExprSpec, otherwise: ExprSpec) -> Self {
        ExprSpec::If {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn route_is(route: ExprSpec, status: RouteStatus) -> Self {
        ExprSpec::RouteStateIs {
            route: Box::new(route),
            status,
        }
    }

    pub fn aspects_of(signal: ExprSpec) -> Self {
        ExprSpec::SignalAspects(Box::new(signal))
    }

    pub fn contains(set: ExprSpec, aspects: &[&str]) -> Self {
        ExprSpec::AspectSetContains {
            set: Box::new(set),
            aspects: aspects.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// An aspect set with unconditional members.
    pub fn aspects(names: &[&str]) -> Self {
        ExprSpec::AspectSet(
            names
                .iter()
                .map(|name| AspectSetMemberSpec {
                    aspect: name.to_string(),
                    condition: None,
                })
                .collect(),
        )
    }

    pub fn call(function: &str, args: Vec<ExprSpec>) -> Self {
        ExprSpec::Call {
            function: function.to_string(),
            args,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    If {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    AspectSet(Vec<AspectSetMember>),
    AspectSetContains {
        set: Box<Expr>,
        aspects: Vec<AspectId>,
    },
    SignalAspects(Box<Expr>),
    RouteStateIs {
        route: Box<Expr>,
        status: RouteStatus,
    },
    SignalRef(SignalId),
    RouteRef(RouteId),
    ArgRef(usize),
    Call {
        function: FunctionId,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AspectSetMember {
    pub aspect: AspectId,
    pub condition: Option<Expr>,
}

/// A parameterized expression shared by several signals.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub args: Vec<(String, ValueType)>,
    pub returns: ValueType,
    pub body: Expr,
}

impl Expr {
    /// Evaluate against the current interlocking state. `args` holds the
    /// arguments of the enclosing function call, if any.
    pub fn eval<S: SignalingState + ?Sized>(
        &self,
        functions: &[FunctionDef],
        state: &S,
        args: &[Value],
    ) -> Result<Value, SimulationError> {
        match self {
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::And(operands) => {
                for operand in operands {
                    if !operand.eval(functions, state, args)?.into_bool()? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(operands) => {
                for operand in operands {
                    if operand.eval(functions, state, args)?.into_bool()? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Not(inner) => Ok(Value::Bool(
                !inner.eval(functions, state, args)?.into_bool()?,
            )),
            Expr::If {
                condition,
                then,
                otherwise,
            } => {
                if condition.eval(functions, state, args)?.into_bool()? {
                    then.eval(functions, state, args)
                } else {
                    otherwise.eval(functions, state, args)
                }
            }
            Expr::AspectSet(members) => {
                let mut set = AspectSet::new();
                for member in members {
                    let included = match &member.condition {
                        Some(condition) => condition.eval(functions, state, args)?.into_bool()?,
                        None => true,
                    };
                    if included {
                        set.insert(member.aspect);
                    }
                }
                Ok(Value::AspectSet(set))
            }
            Expr::AspectSetContains { set, aspects } => {
                let set = set.eval(functions, state, args)?.into_aspect_set()?;
                Ok(Value::Bool(aspects.iter().any(|a| set.contains(a))))
            }
            Expr::SignalAspects(signal) => {
                let signal = signal.eval(functions, state, args)?.into_signal()?;
                Ok(Value::AspectSet(state.signal_aspects(signal).clone()))
            }
            Expr::RouteStateIs { route, status } => {
                let route = route.eval(functions, state, args)?.into_route()?;
                Ok(Value::Bool(state.route_status(route) == *status))
            }
            Expr::SignalRef(id) => Ok(Value::Signal(*id)),
            Expr::RouteRef(id) => Ok(Value::Route(*id)),
            Expr::ArgRef(index) => args.get(*index).cloned().ok_or_else(|| {
                SimulationError::InconsistentChange(format!("argument {index} is not bound"))
            }),
            Expr::Call {
                function,
                args: call_args,
            } => {
                let values = call_args
                    .iter()
                    .map(|arg| arg.eval(functions, state, args))
                    .collect::<Result<Vec<_>, _>>()?;
                functions[function.index()]
                    .body
                    .eval(functions, state, &values)
            }
        }
    }

    /// Every route and signal this expression can read, following calls.
    pub fn collect_refs(
        &self,
        functions: &[FunctionDef],
        routes: &mut BTreeSet<RouteId>,
        signals: &mut BTreeSet<SignalId>,
    ) {
        self.visit(&mut |expr| match expr {
            Expr::RouteRef(id) => {
                routes.insert(*id);
            }
            Expr::SignalRef(id) => {
                signals.insert(*id);
            }
            Expr::Call { function, .. } => {
                functions[function.index()]
                    .body
                    .collect_refs(functions, routes, signals);
            }
            _ => {}
        });
    }

    /// Functions called directly by this expression.
    pub fn collect_calls(&self, calls: &mut BTreeSet<FunctionId>) {
        self.visit(&mut |expr| {
            if let Expr::Call { function, .. } = expr {
                calls.insert(*function);
            }
        });
    }

    fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::And(operands) | Expr::Or(operands) => {
                for operand in operands {
                    operand.visit(f);
                }
            }
            Expr::Not(inner) | Expr::SignalAspects(inner) => inner.visit(f),
            Expr::If {
                condition,
                then,
                otherwise,
            } => {
                condition.visit(f);
                then.visit(f);
                otherwise.visit(f);
            }
            Expr::AspectSet(members) => {
                for condition in members.iter().filter_map(|m| m.condition.as_ref()) {
                    condition.visit(f);
                }
            }
            Expr::AspectSetContains { set, .. } => set.visit(f),
            Expr::RouteStateIs { route, .. } => route.visit(f),
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.visit(f);
                }
            }
            Expr::Bool(_) | Expr::SignalRef(_) | Expr::RouteRef(_) | Expr::ArgRef(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Name tables used to resolve [`ExprSpec`] trees.
pub struct Resolver<'a> {
    pub aspects: &'a HashMap<String, AspectId>,
    pub signals: &'a HashMap<String, SignalId>,
    pub routes: &'a HashMap<String, RouteId>,
    pub functions: &'a HashMap<String, FunctionId>,
    /// Argument and return types of each function, by id.
    pub signatures: &'a [(Vec<ValueType>, ValueType)],
}

impl Resolver<'_> {
    /// Resolve names and type-check. `params` are the arguments in scope when
    /// resolving a function body; `context` names the owner in errors.
    pub fn resolve(
        &self,
        spec: &ExprSpec,
        params: Option<&[(String, ValueType)]>,
        context: &str,
    ) -> Result<(Expr, ValueType), ValidationError> {
        let typed = |expr: &ExprSpec, expected: ValueType| -> Result<Expr, ValidationError> {
            let (resolved, found) = self.resolve(expr, params, context)?;
            if found != expected {
                return Err(ValidationError::TypeMismatch {
                    context: context.to_string(),
                    expected,
                    found,
                });
            }
            Ok(resolved)
        };

        let resolved = match spec {
            ExprSpec::Bool(b) => (Expr::Bool(*b), ValueType::Bool),
            ExprSpec::And(operands) => (
                Expr::And(
                    operands
                        .iter()
                        .map(|o| typed(o, ValueType::Bool))
                        .collect::<Result<_, _>>()?,
                ),
                ValueType::Bool,
            ),
            ExprSpec::Or(operands) => (
                Expr::Or(
                    operands
                        .iter()
                        .map(|o| typed(o, ValueType::Bool))
                        .collect::<Result<_, _>>()?,
                ),
                ValueType::Bool,
            ),
            ExprSpec::Not(inner) => (
                Expr::Not(Box::new(typed(inner, ValueType::Bool)?)),
                ValueType::Bool,
            ),
            ExprSpec::If {
                condition,
                then,
                otherwise,
            } => {
                let condition = typed(condition, ValueType::Bool)?;
                let (then, then_type) = self.resolve(then, params, context)?;
                let otherwise = typed(otherwise, then_type)?;
                (
                    Expr::If {
                        condition: Box::new(condition),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    },
                    then_type,
                )
            }
            ExprSpec::AspectSet(members) => {
                let mut resolved = Vec::with_capacity(members.len());
                for member in members {
                    resolved.push(AspectSetMember {
                        aspect: self.aspect(&member.aspect)?,
                        condition: member
                            .condition
                            .as_ref()
                            .map(|c| typed(c, ValueType::Bool))
                            .transpose()?,
                    });
                }
                (Expr::AspectSet(resolved), ValueType::AspectSet)
            }
            ExprSpec::AspectSetContains { set, aspects } => (
                Expr::AspectSetContains {
                    set: Box::new(typed(set, ValueType::AspectSet)?),
                    aspects: aspects
                        .iter()
                        .map(|a| self.aspect(a))
                        .collect::<Result<_, _>>()?,
                },
                ValueType::Bool,
            ),
            ExprSpec::SignalAspects(signal) => (
                Expr::SignalAspects(Box::new(typed(signal, ValueType::Signal)?)),
                ValueType::AspectSet,
            ),
            ExprSpec::RouteStateIs { route, status } => (
                Expr::RouteStateIs {
                    route: Box::new(typed(route, ValueType::Route)?),
                    status: *status,
                },
                ValueType::Bool,
            ),
            ExprSpec::Signal(name) => {
                let id = self.signals.get(name).ok_or_else(|| unknown("signal", name))?;
                (Expr::SignalRef(*id), ValueType::Signal)
            }
            ExprSpec::Route(name) => {
                let id = self.routes.get(name).ok_or_else(|| unknown("route", name))?;
                (Expr::RouteRef(*id), ValueType::Route)
            }
            ExprSpec::Arg(name) => {
                let params =
                    params.ok_or_else(|| ValidationError::ArgumentOutsideFunction(name.clone()))?;
                let index = params
                    .iter()
                    .position(|(param, _)| param == name)
                    .ok_or_else(|| unknown("argument", name))?;
                (Expr::ArgRef(index), params[index].1)
            }
            ExprSpec::Call { function, args } => {
                let id = *self
                    .functions
                    .get(function)
                    .ok_or_else(|| unknown("function", function))?;
                let (arg_types, returns) = &self.signatures[id.index()];
                if arg_types.len() != args.len() {
                    return Err(ValidationError::ArityMismatch {
                        function: function.clone(),
                        expected: arg_types.len(),
                        found: args.len(),
                    });
                }
                let args = args
                    .iter()
                    .zip(arg_types)
                    .map(|(arg, ty)| typed(arg, *ty))
                    .collect::<Result<_, _>>()?;
                (Expr::Call { function: id, args }, *returns)
            }
        };
        Ok(resolved)
    }

    fn aspect(&self, name: &str) -> Result<AspectId, ValidationError> {
        self.aspects
            .get(name)
            .copied()
            .ok_or_else(|| unknown("aspect", name))
    }
}

fn unknown(kind: &'static str, name: &str) -> ValidationError {
    ValidationError::UnknownName {
        kind,
        name: name.to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
