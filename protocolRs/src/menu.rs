//! Menu trees of instruments that are operated through on-device menus.
//!
//! Each menu lists the [`Direction`]s that lead to it from the root menu: either a [`Step`], i.e.,
//! a key to press and the prompt to wait for, or the name of another menu whose directions have
//! to be followed first.

use std::{collections::HashMap, time::Duration};

use serde::Deserialize;

use crate::InstrumentError;

fn default_step_timeout() -> Duration {
    Duration::from_secs(10)
}

/// A single key press in a menu and the prompt that shows up after it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Step {
    /// The command to send, usually a single key.
    pub command: String,
    /// The prompt that confirms the step.
    pub response: String,
    /// How long to wait for the prompt.
    #[serde(with = "humantime_serde", default = "default_step_timeout")]
    pub timeout: Duration,
}

impl Step {
    /// Create a step with the default timeout of 10 seconds.
    pub fn new(command: &str, response: &str) -> Self {
        Step {
            command: command.to_string(),
            response: response.to_string(),
            timeout: default_step_timeout(),
        }
    }

    /// Change the timeout of this step.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One entry in the directions to a menu.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Direction {
    /// Send a command and wait for its prompt.
    Step(Step),
    /// Follow all directions to the named menu.
    Menu(String),
}

/// Directions to every menu of an instrument.
///
/// The tree is checked when it is created: every referenced menu must exist and references must
/// not form a cycle. After that, it is read only.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
///
/// use protocolrs::{Direction, MenuTree, Step};
///
/// let tree = MenuTree::new(HashMap::from([
///     ("main".to_string(), vec![Direction::Step(Step::new("0", "Main Menu>"))]),
///     (
///         "clock".to_string(),
///         vec![
///             Direction::Menu("main".to_string()),
///             Direction::Step(Step::new("1", "Clock Menu>")),
///         ],
///     ),
/// ]))
/// .unwrap();
///
/// let commands: Vec<String> = tree.resolve("clock").unwrap().into_iter().map(|s| s.command).collect();
/// assert_eq!(commands, vec!["0", "1"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "HashMap<String, Vec<Direction>>")]
pub struct MenuTree {
    menus: HashMap<String, Vec<Direction>>,
}

impl MenuTree {
    /// Create a menu tree from the directions to each menu.
    ///
    /// Fails with [`InstrumentError::Config`] if a menu references a menu that does not exist or
    /// if menus reference each other in a cycle.
    pub fn new(menus: HashMap<String, Vec<Direction>>) -> Result<Self, InstrumentError> {
        let tree = MenuTree { menus };
        let mut names: Vec<&String> = tree.menus.keys().collect();
        names.sort();
        for name in names {
            tree.resolve(name).map_err(|e| match e {
                InstrumentError::Protocol(msg) => InstrumentError::Config(msg),
                other => other,
            })?;
        }
        Ok(tree)
    }

    /// `true` if the tree knows directions to `menu_id`.
    pub fn contains(&self, menu_id: &str) -> bool {
        self.menus.contains_key(menu_id)
    }

    /// Every step of every menu, in no particular order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.menus.values().flatten().filter_map(|direction| match direction {
            Direction::Step(step) => Some(step),
            Direction::Menu(_) => None,
        })
    }

    /// All steps needed to get to `menu_id`, in order.
    ///
    /// Menu references are expanded depth first, left to right.
    ///
    /// # Errors
    /// - [`InstrumentError::Protocol`] if `menu_id`, or a menu it references, is unknown.
    /// - [`InstrumentError::Config`] if the references form a cycle.
    pub fn resolve(&self, menu_id: &str) -> Result<Vec<Step>, InstrumentError> {
        let mut steps = Vec::new();
        let mut path = Vec::new();
        self.resolve_into(menu_id, &mut path, &mut steps)?;
        Ok(steps)
    }

    fn resolve_into<'a>(
        &'a self,
        menu_id: &'a str,
        path: &mut Vec<&'a str>,
        steps: &mut Vec<Step>,
    ) -> Result<(), InstrumentError> {
        if path.contains(&menu_id) {
            path.push(menu_id);
            return Err(InstrumentError::Config(format!(
                "Menu references form a cycle: {}",
                path.join(" -> ")
            )));
        }
        let directions = self
            .menus
            .get(menu_id)
            .ok_or_else(|| InstrumentError::Protocol(format!("Unknown menu: {menu_id}")))?;

        path.push(menu_id);
        for direction in directions {
            match direction {
                Direction::Step(step) => steps.push(step.clone()),
                Direction::Menu(submenu) => self.resolve_into(submenu, path, steps)?,
            }
        }
        path.pop();
        Ok(())
    }
}

impl TryFrom<HashMap<String, Vec<Direction>>> for MenuTree {
    type Error = InstrumentError;

    fn try_from(menus: HashMap<String, Vec<Direction>>) -> Result<Self, Self::Error> {
        MenuTree::new(menus)
    }
}
