use crate::config::PerformancePreset;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The translator switch for block compilation.
pub const DYNAREC_VAR: &str = "BOX64_DYNAREC";

/// Throughput-oriented settings for the first bootstrap attempt.
const THROUGHPUT: &[(&str, &str)] = &[
    (DYNAREC_VAR, "1"),
    ("BOX64_DYNAREC_BIGBLOCK", "2"),
    ("BOX64_DYNAREC_STRONGMEM", "0"),
    ("BOX64_DYNAREC_FASTNAN", "1"),
    ("BOX64_DYNAREC_FASTROUND", "1"),
    ("BOX64_DYNAREC_SAFEFLAGS", "0"),
    ("BOX64_DYNAREC_CALLRET", "1"),
    ("BOX64_LOG", "0"),
];

/// Settings for the middle attempts: block compilation stays on, shortcuts are off.
const CONSERVATIVE: &[(&str, &str)] = &[
    (DYNAREC_VAR, "1"),
    ("BOX64_DYNAREC_BIGBLOCK", "0"),
    ("BOX64_DYNAREC_STRONGMEM", "2"),
    ("BOX64_DYNAREC_FASTNAN", "0"),
    ("BOX64_DYNAREC_FASTROUND", "0"),
    ("BOX64_DYNAREC_SAFEFLAGS", "2"),
    ("BOX64_DYNAREC_CALLRET", "0"),
    ("BOX64_LOG", "1"),
];

/// The last resort: pure interpretation with every diagnostic the translator has.
const INTERPRETER: &[(&str, &str)] = &[
    (DYNAREC_VAR, "0"),
    ("BOX64_LOG", "2"),
    ("BOX64_SHOWSEGV", "1"),
    ("BOX64_SHOWBT", "1"),
    ("BOX64_DLSYM_ERROR", "1"),
];

const STABILITY: &[(&str, &str)] = &[
    (DYNAREC_VAR, "1"),
    ("BOX64_DYNAREC_BIGBLOCK", "0"),
    ("BOX64_DYNAREC_STRONGMEM", "2"),
    ("BOX64_DYNAREC_X87DOUBLE", "1"),
    ("BOX64_DYNAREC_FASTNAN", "0"),
    ("BOX64_DYNAREC_FASTROUND", "0"),
    ("BOX64_DYNAREC_SAFEFLAGS", "2"),
    ("BOX64_DYNAREC_CALLRET", "0"),
];

const COMPATIBILITY: &[(&str, &str)] = &[
    (DYNAREC_VAR, "1"),
    ("BOX64_DYNAREC_BIGBLOCK", "0"),
    ("BOX64_DYNAREC_STRONGMEM", "1"),
    ("BOX64_DYNAREC_FASTNAN", "1"),
    ("BOX64_DYNAREC_FASTROUND", "0"),
    ("BOX64_DYNAREC_SAFEFLAGS", "2"),
    ("BOX64_DYNAREC_CALLRET", "0"),
];

const INTERMEDIATE: &[(&str, &str)] = &[
    (DYNAREC_VAR, "1"),
    ("BOX64_DYNAREC_BIGBLOCK", "1"),
    ("BOX64_DYNAREC_STRONGMEM", "0"),
    ("BOX64_DYNAREC_FASTNAN", "1"),
    ("BOX64_DYNAREC_FASTROUND", "1"),
    ("BOX64_DYNAREC_SAFEFLAGS", "1"),
    ("BOX64_DYNAREC_CALLRET", "0"),
];

const PERFORMANCE: &[(&str, &str)] = &[
    (DYNAREC_VAR, "1"),
    ("BOX64_DYNAREC_BIGBLOCK", "3"),
    ("BOX64_DYNAREC_STRONGMEM", "0"),
    ("BOX64_DYNAREC_FASTNAN", "1"),
    ("BOX64_DYNAREC_FASTROUND", "1"),
    ("BOX64_DYNAREC_SAFEFLAGS", "0"),
    ("BOX64_DYNAREC_CALLRET", "1"),
];

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Translator knobs for bootstrap attempt `index` out of a budget whose final index is `last`.
///
/// Attempt 0 favours throughput and the final attempt disables block compilation. Anything in
/// between keeps compilation with every shortcut turned off. With a budget of one attempt the
/// only attempt is attempt 0.
pub fn attempt_tuning(index: u32, last: u32) -> &'static [(&'static str, &'static str)] {
    match index {
        0 => THROUGHPUT,
        n if n >= last => INTERPRETER,
        _ => CONSERVATIVE,
    }
}

/// Whether bootstrap attempt `index` is the one running without block compilation.
pub fn is_interpreter_attempt(index: u32, last: u32) -> bool {
    index > 0 && index >= last
}

/// Translator knobs for a steady-state launch.
pub fn preset_tuning(preset: PerformancePreset) -> &'static [(&'static str, &'static str)] {
    match preset {
        PerformancePreset::Stability => STABILITY,
        PerformancePreset::Compatibility => COMPATIBILITY,
        PerformancePreset::Intermediate => INTERMEDIATE,
        PerformancePreset::Performance => PERFORMANCE,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
