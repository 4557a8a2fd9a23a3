use crate::error::EngineError;
use crate::jit::{CompiledFunctionWithArgument, JitCallContext};
use crate::vars::VarsMapper;

use log::debug;

/// Everything the 1-D optimizer needs: the compiled line function `l(λ)`, its
/// derivative, and optionally higher derivatives (the first of which, when
/// present, supplies the curvature for the initial Newton step).
///
/// The caller must have evaluated the objective function and its gradient at
/// the mapper's current point before searching, so that the shared scratch
/// slots the line function relies on are populated and the emission-order
/// ladder admits `l` and its derivatives.
pub struct LineSearchContext<'a> {
    pub jit_call_context: &'a JitCallContext,
    pub vars_mapper: &'a VarsMapper,
    pub l: &'a CompiledFunctionWithArgument,
    pub d: &'a CompiledFunctionWithArgument,
    pub more_ds: Vec<&'a CompiledFunctionWithArgument>,
}

/// One probe of the line function, for diagnostics and plotting.
#[derive(Clone, Copy, Debug)]
pub struct IntermediatePoint {
    pub step: f64,
    pub f: f64,
    pub df: f64,
}

#[derive(Debug)]
pub struct LineSearchResult {
    pub best_step: f64,
    /// Probes of the bracketing and derivative-bisection stages.
    pub path1: Vec<IntermediatePoint>,
    /// Probes of the value-bisection fallback, when it ran.
    pub path2: Vec<IntermediatePoint>,
    pub comments: Vec<String>,
}

const MAX_EXPANSIONS: usize = 60;
const MAX_BISECTIONS: usize = 100;

struct Prober<'a> {
    context: &'a LineSearchContext<'a>,
    best_step: f64,
    best_f: f64,
}

impl Prober<'_> {
    fn probe(
        &mut self,
        step: f64,
        path: &mut Vec<IntermediatePoint>,
    ) -> Result<(f64, f64), EngineError> {
        let x = &self.context.vars_mapper.x;
        let f = self.context.l.call(self.context.jit_call_context, x, step)?;
        let df = self.context.d.call(self.context.jit_call_context, x, step)?;
        path.push(IntermediatePoint { step, f, df });
        if f < self.best_f {
            self.best_f = f;
            self.best_step = step;
        }
        Ok((f, df))
    }
}

/// Finds a step length approximately minimizing `l(λ)` along the line.
///
/// The first trial step is Newton's `−l′(0)/l″(0)` when the second
/// derivative is available, otherwise a unit step against the slope refined
/// by a secant on the derivative; either way it is exact for a quadratic
/// `l`. From there the trial expands geometrically until the derivative
/// changes sign or the value stops improving, then bisects on the derivative
/// (`path1`). When no derivative sign change shows up, falls back to a
/// binary search over the value (`path2`).
pub fn line_search(context: &LineSearchContext) -> Result<LineSearchResult, EngineError> {
    let mut result = LineSearchResult {
        best_step: 0.0,
        path1: Vec::new(),
        path2: Vec::new(),
        comments: Vec::new(),
    };
    let mut prober = Prober {
        context,
        best_step: 0.0,
        best_f: f64::INFINITY,
    };

    let (_, d0) = prober.probe(0.0, &mut result.path1)?;
    if d0 == 0.0 {
        result.comments.push("zero derivative at the starting point".to_string());
        return Ok(result);
    }

    // Curvature from l'' when the caller compiled it.
    let d2_0 = match context.more_ds.first() {
        Some(second_derivative) => {
            second_derivative.call(context.jit_call_context, &context.vars_mapper.x, 0.0)?
        }
        None => f64::NAN,
    };

    let mut first = if d2_0.is_finite() && d2_0 > 0.0 {
        -d0 / d2_0
    } else {
        // No usable curvature: take a unit step against the slope, then
        // refine it with a secant through the two derivative samples. For a
        // quadratic the secant root is the exact minimum.
        let unit = -d0.signum();
        let (_, du) = prober.probe(unit, &mut result.path1)?;
        if du == 0.0 {
            result.best_step = unit;
            result
                .comments
                .push("a trial step landed on a stationary point".to_string());
            return Ok(result);
        }
        let secant = unit * d0 / (d0 - du);
        if secant.is_finite() && secant != 0.0 && secant.signum() == unit.signum() {
            secant
        } else {
            unit
        }
    };
    if !first.is_finite() || first == 0.0 {
        first = -d0.signum();
    }

    // Expansion: geometric probes away from zero until the derivative flips
    // sign or the value turns back up.
    let mut derivative_bracket: Option<(f64, f64)> = None;
    let mut value_bracket: Option<(f64, f64)> = None;
    let mut step_before_previous = 0.0;
    let mut previous_step = 0.0;
    let mut previous_f = prober.best_f;
    let mut step = first;
    for _ in 0..MAX_EXPANSIONS {
        let (fs, ds) = prober.probe(step, &mut result.path1)?;
        if ds == 0.0 {
            result.best_step = step;
            result
                .comments
                .push("a trial step landed on a stationary point".to_string());
            debug!("line search: exact stationary point at {step}");
            return Ok(result);
        }
        if !ds.is_finite() || fs.is_nan() {
            value_bracket = Some((step_before_previous, step));
            result
                .comments
                .push("non-finite probe; restricting to the explored range".to_string());
            break;
        }
        if ds.signum() != d0.signum() {
            derivative_bracket = Some((previous_step, step));
            result
                .comments
                .push("search range bracketed by a derivative sign change".to_string());
            break;
        }
        if fs > previous_f {
            value_bracket = Some((step_before_previous, step));
            result
                .comments
                .push("search range bracketed by a value increase".to_string());
            break;
        }
        step_before_previous = previous_step;
        previous_step = step;
        previous_f = fs;
        step *= 2.0;
    }

    if let Some((mut near, mut far)) = derivative_bracket {
        // Bisect on the derivative; `near` keeps the sign of d0.
        for _ in 0..MAX_BISECTIONS {
            let mid = 0.5 * (near + far);
            if mid == near || mid == far {
                break;
            }
            let (_, dm) = prober.probe(mid, &mut result.path1)?;
            if dm == 0.0 {
                break;
            }
            if dm.signum() == d0.signum() {
                near = mid;
            } else {
                far = mid;
            }
        }
        result
            .comments
            .push("derivative bisection converged".to_string());
    } else if let Some((a, b)) = value_bracket {
        // No sign change to chase: binary-minimize the value on the range.
        let (mut lo, mut hi) = (a.min(b), a.max(b));
        for _ in 0..MAX_BISECTIONS {
            let third = (hi - lo) / 3.0;
            if third == 0.0 {
                break;
            }
            let m1 = lo + third;
            let m2 = hi - third;
            let (f1, _) = prober.probe(m1, &mut result.path2)?;
            let (f2, _) = prober.probe(m2, &mut result.path2)?;
            if f1 < f2 {
                hi = m2;
            } else {
                lo = m1;
            }
        }
        result
            .comments
            .push("minimum located by a binary search over the value".to_string());
    } else {
        result
            .comments
            .push("no bracket within the expansion budget; keeping the best probe".to_string());
    }

    result.best_step = prober.best_step;
    debug!(
        "line search: best step {} after {}+{} probes",
        result.best_step,
        result.path1.len(),
        result.path2.len()
    );
    Ok(result)
}
