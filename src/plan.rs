//! Test plans.
//!
//! A plan is the ordered list of buttons the actuator visits in one run,
//! loaded from TOML:
//!
//! ```toml
//! command_template = "G90 X{x} Y{y}"
//!
//! [[buttons]]
//! name = "Power"
//! x = 12.5
//! y = 40.0
//!
//! [[buttons]]
//! name = "Vol +"
//! x = 30.0
//! y = 40.0
//! command = "G90 X{x} Y{y} F3000"
//! ```
//!
//! Templates use `strfmt` placeholders: `{x}`, `{y}`, `{name}` and `{index}`
//! (zero-based).

use std::collections::HashMap;
use std::path::Path;

use rbs_core::{FixtureError, FixtureResult};
use serde::{Deserialize, Serialize};

fn default_template() -> String {
    "G90 X{x} Y{y}".to_string()
}

/// One button the actuator visits and presses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonTarget {
    /// Logical button name.
    pub name: String,
    /// Stage X coordinate.
    pub x: f64,
    /// Stage Y coordinate.
    pub y: f64,
    /// Per-button motion template overriding the plan's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl ButtonTarget {
    /// Button at `(x, y)` using the plan's template.
    pub fn new(name: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            command: None,
        }
    }

    /// Render the motion command for this button.
    pub fn motion_command(&self, index: usize, plan_template: &str) -> FixtureResult<String> {
        let template = self.command.as_deref().unwrap_or(plan_template);
        let mut vars = HashMap::new();
        vars.insert("x".to_string(), self.x.to_string());
        vars.insert("y".to_string(), self.y.to_string());
        vars.insert("name".to_string(), self.name.clone());
        vars.insert("index".to_string(), index.to_string());

        strfmt::strfmt(template, &vars).map_err(|e| {
            FixtureError::Configuration(format!(
                "motion template '{template}' for button '{}': {e}",
                self.name
            ))
        })
    }
}

/// Ordered list of buttons for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPlan {
    /// Motion template used by buttons without their own.
    #[serde(default = "default_template")]
    pub command_template: String,
    /// Buttons in visiting order.
    #[serde(default)]
    pub buttons: Vec<ButtonTarget>,
}

impl Default for TestPlan {
    fn default() -> Self {
        Self {
            command_template: default_template(),
            buttons: Vec::new(),
        }
    }
}

impl TestPlan {
    /// Plan over `buttons` with the default template.
    pub fn new(buttons: Vec<ButtonTarget>) -> Self {
        Self {
            buttons,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML plan.
    pub fn from_toml_str(text: &str) -> FixtureResult<Self> {
        let plan: TestPlan =
            toml::from_str(text).map_err(|e| FixtureError::Configuration(format!("invalid test plan: {e}")))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Load and validate a TOML plan file.
    pub fn load(path: &Path) -> FixtureResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Every button must have a name and a renderable command.
    pub fn validate(&self) -> FixtureResult<()> {
        for (index, button) in self.buttons.iter().enumerate() {
            if button.name.trim().is_empty() {
                return Err(FixtureError::Configuration(format!("button {index} has no name")));
            }
            button.motion_command(index, &self.command_template)?;
        }
        Ok(())
    }

    /// Number of buttons.
    pub fn len(&self) -> usize {
        self.buttons.len()
    }

    /// Whether the plan has no buttons.
    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_default_template() {
        let button = ButtonTarget::new("Power", 29.787, 82.987);
        assert_eq!(
            button.motion_command(0, &default_template()).unwrap(),
            "G90 X29.787 Y82.987"
        );
    }

    #[test]
    fn per_button_template_wins() {
        let plan = TestPlan::from_toml_str(
            r#"
            [[buttons]]
            name = "Power"
            x = 1.0
            y = 2.5

            [[buttons]]
            name = "Mute"
            x = 3
            y = 4
            command = "G1 X{x} Y{y} F{index}"
            "#,
        )
        .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan.buttons[0].motion_command(0, &plan.command_template).unwrap(),
            "G90 X1 Y2.5"
        );
        assert_eq!(
            plan.buttons[1].motion_command(1, &plan.command_template).unwrap(),
            "G1 X3 Y4 F1"
        );
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let err = TestPlan::from_toml_str(
            r#"
            command_template = "G90 X{x} Z{z}"
            [[buttons]]
            name = "Power"
            x = 1.0
            y = 2.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FixtureError::Configuration(_)));
    }

    #[test]
    fn blank_names_are_rejected() {
        let plan = TestPlan::new(vec![ButtonTarget::new(" ", 0.0, 0.0)]);
        assert!(plan.validate().is_err());
    }
}
