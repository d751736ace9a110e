use protocol::HsvColor;

const EPSILON: f64 = 0.001;
const NEUTRAL_HUE: f64 = 0.2;
const HUE_SPAN: f64 = -0.2;
const MIN_VALUE: f64 = 0.5;
const SATURATION: f64 = 1.0;

/// How far current draw sits from the baseline for this hour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deviation {
    pub difference: f64,
    pub color: HsvColor,
}

/// Maps current draw against the hourly baseline to a difference and a color:
/// yellow-green at baseline, red above it, green below it, brighter the
/// further off it is.
pub fn encode(total_wattage: f64, baseline: f64) -> Deviation {
    let difference = total_wattage - baseline;
    let normalized = (difference / (baseline + EPSILON)).clamp(-1.0, 1.0);

    let hue = normalized * HUE_SPAN + NEUTRAL_HUE;
    let value = normalized.abs() / 3.0 + MIN_VALUE;

    Deviation {
        difference,
        color: HsvColor(hue, SATURATION, value),
    }
}
