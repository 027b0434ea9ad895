//! Multiplier curve projector: a pure mapping from (multiplier, phase) to a
//! 2-D position for the flight marker.
//!
//! Both axes are functions of the multiplier alone, never of wall-clock time
//! or accumulated history. That is the refresh-safety contract: reloading
//! mid-round and re-fetching only the current multiplier reproduces an
//! identical frame.

use updraft_types::{constants::DEFAULT_DISPLAY_CEILING, Multiplier, RoundPhase};

/// Normalized position on the display, both axes in `[0, 1]`, plus the
/// marker's orientation (radians, counter-clockwise from horizontal).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    pub x: f64,
    pub y: f64,
    pub angle: f64,
}

/// Projects the multiplier onto the display rectangle.
///
/// Horizontal progress is logarithmic in the multiplier, so visual progress
/// approximates elapsed time under the server's exponential growth curve;
/// vertical progress is linear. Both saturate at the display ceiling.
#[derive(Clone, Copy, Debug)]
pub struct CurveProjector {
    /// Multiplier at which the marker pins to the top-right corner.
    ceiling: f64,
}

impl Default for CurveProjector {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_DISPLAY_CEILING,
        }
    }
}

impl CurveProjector {
    pub fn new(ceiling: f64) -> Self {
        debug_assert!(ceiling > 1.0);
        Self { ceiling }
    }

    /// Endpoint of the curve for the given state.
    pub fn project(&self, multiplier: Multiplier, phase: RoundPhase) -> Projection {
        let m = match phase {
            // Before launch there is nothing to draw; the multiplier field
            // may hold a leftover value during the transition.
            RoundPhase::Idle | RoundPhase::Waiting => 1.0,
            RoundPhase::Running | RoundPhase::Crashed => multiplier.as_f64().max(1.0),
        };

        let x = (m.ln() / self.ceiling.ln()).min(1.0);
        let y = ((m - 1.0) / (self.ceiling - 1.0)).min(1.0);

        // Orientation follows the endpoint tangent of the drawn curve.
        let (tx, ty) = endpoint_tangent(x, y);
        let angle = if tx == 0.0 && ty == 0.0 {
            0.0
        } else {
            ty.atan2(tx)
        };

        Projection { x, y, angle }
    }

    /// A point of the drawn curve at parameter `t` in `[0, 1]`: a cubic
    /// Bezier from the fixed origin to the projected endpoint.
    pub fn curve_point(&self, multiplier: Multiplier, phase: RoundPhase, t: f64) -> (f64, f64) {
        let Projection { x, y, .. } = self.project(multiplier, phase);
        let t = t.clamp(0.0, 1.0);
        let (p1, p2) = control_points(x, y);

        let u = 1.0 - t;
        let bx = 3.0 * u * u * t * p1.0 + 3.0 * u * t * t * p2.0 + t * t * t * x;
        let by = 3.0 * u * u * t * p1.1 + 3.0 * u * t * t * p2.1 + t * t * t * y;
        (bx, by)
    }
}

/// Control points shaping the climb: flat departure from the origin,
/// steepening toward the marker.
fn control_points(x: f64, y: f64) -> ((f64, f64), (f64, f64)) {
    ((0.5 * x, 0.0), (0.8 * x, 0.5 * y))
}

/// Direction of the curve at its endpoint (unnormalized).
fn endpoint_tangent(x: f64, y: f64) -> (f64, f64) {
    let (_, p2) = control_points(x, y);
    (x - p2.0, y - p2.1)
}
