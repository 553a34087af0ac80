pub mod color_ops;
pub mod dotenv_utils;
pub mod gradio;
pub mod image_io;
pub mod inpaint;
pub mod instruction;
pub mod llm;
pub mod remote_models;
pub mod runtime;
pub mod segmentation;
pub mod settings_layer;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditAction {
    Remove,
    Replace,
}

impl EditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remove => "remove",
            Self::Replace => "replace",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remove" => Some(Self::Remove),
            "replace" => Some(Self::Replace),
            _ => None,
        }
    }
}

/// One structured edit extracted from user text.
///
/// `target` is `Some` exactly when `action` is [`EditAction::Replace`]; the
/// constructors are the only way to build one, so the pairing always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditInstruction {
    action: EditAction,
    object: String,
    target: Option<String>,
}

impl EditInstruction {
    pub fn remove(object: impl Into<String>) -> Self {
        Self {
            action: EditAction::Remove,
            object: object.into(),
            target: None,
        }
    }

    pub fn replace(object: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            action: EditAction::Replace,
            object: object.into(),
            target: Some(target.into()),
        }
    }

    pub fn action(&self) -> EditAction {
        self.action
    }

    pub fn object(&self) -> &str {
        self.object.as_str()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Prompt handed to the inpainting model for this edit.
    pub fn inpaint_prompt(&self) -> &str {
        match (self.action, self.target.as_deref()) {
            (EditAction::Replace, Some(target)) => target,
            _ => "background",
        }
    }
}

/// Instructions in the order the language model emitted them.
pub type ParsedInstructionSet = Vec<EditInstruction>;

/// A named segmentation backend. `uri` is either a Space id (`owner/name`)
/// or a full base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub name: String,
    pub uri: String,
}

impl EndpointDescriptor {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_uses_target_as_inpaint_prompt() {
        let instruction = EditInstruction::replace("car", "bus");
        assert_eq!(instruction.action(), EditAction::Replace);
        assert_eq!(instruction.target(), Some("bus"));
        assert_eq!(instruction.inpaint_prompt(), "bus");
    }

    #[test]
    fn remove_uses_literal_background_prompt() {
        let instruction = EditInstruction::remove("tiger");
        assert_eq!(instruction.target(), None);
        assert_eq!(instruction.inpaint_prompt(), "background");
    }

    #[test]
    fn action_parse_is_case_insensitive() {
        assert_eq!(EditAction::parse(" Remove "), Some(EditAction::Remove));
        assert_eq!(EditAction::parse("REPLACE"), Some(EditAction::Replace));
        assert_eq!(EditAction::parse("recolor"), None);
    }
}
