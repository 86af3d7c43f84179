//! Common cron presets offered when creating a schedule.

use serde::Serialize;

/// A named cron expression suggestion.
#[derive(Debug, Clone, Serialize)]
pub struct CronPreset {
    pub label: &'static str,
    pub expression: &'static str,
}

/// Return the built-in presets.
pub fn presets() -> Vec<CronPreset> {
    vec![
        CronPreset {
            label: "Every day at midnight",
            expression: "0 0 * * *",
        },
        CronPreset {
            label: "Every hour",
            expression: "0 * * * *",
        },
        CronPreset {
            label: "Every 6 hours",
            expression: "0 */6 * * *",
        },
        CronPreset {
            label: "Every 12 hours",
            expression: "0 */12 * * *",
        },
        CronPreset {
            label: "Every Monday at 9 AM",
            expression: "0 9 * * 1",
        },
        CronPreset {
            label: "Every weekday at 9 AM",
            expression: "0 9 * * 1-5",
        },
        CronPreset {
            label: "Every weekend at 10 AM",
            expression: "0 10 * * 0,6",
        },
    ]
}
