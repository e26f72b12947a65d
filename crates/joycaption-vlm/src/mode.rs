use std::fmt;
use std::str::FromStr;

use crate::error::JoyCaptionError;

/// The prompt template used to ask the model for a caption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CaptionMode {
    /// A long free-form description.
    #[default]
    Descriptive,
    /// A concise caption with concrete visual details.
    Straightforward,
    /// Comma-separated Danbooru tags.
    Booru,
    /// A tag-style caption for training datasets.
    Training,
}

impl CaptionMode {
    pub const ALL: [CaptionMode; 4] = [
        CaptionMode::Descriptive,
        CaptionMode::Straightforward,
        CaptionMode::Booru,
        CaptionMode::Training,
    ];

    /// The name accepted on the command line.
    pub fn name(self) -> &'static str {
        match self {
            CaptionMode::Descriptive => "descriptive",
            CaptionMode::Straightforward => "straightforward",
            CaptionMode::Booru => "booru",
            CaptionMode::Training => "training",
        }
    }

    /// The instruction sent to the model as the user turn.
    pub fn prompt(self) -> &'static str {
        match self {
            CaptionMode::Descriptive => "Write a long detailed description for this image.",
            CaptionMode::Straightforward => concat!(
                "Write a straightforward caption for this image. Begin with the main subject and medium. ",
                "Mention pivotal elements—people, objects, scenery—using confident, definite language. ",
                "Focus on concrete details like color, shape, texture, and spatial relationships. ",
                "Show how elements interact. Omit mood and speculative wording. ",
                "If text is present, quote it exactly. Note any watermarks, signatures, or compression artifacts. ",
                "Never mention what's absent, resolution, or unobservable details. ",
                "Vary your sentence structure and keep the description concise, without starting with \"This image is…\" or similar phrasing."
            ),
            CaptionMode::Booru => concat!(
                "Generate only comma-separated Danbooru tags (lowercase_underscores). ",
                "Strict order: artist:, copyright:, character:, meta:, then general tags. ",
                "Include counts (1girl), appearance, clothing, accessories, pose, expression, actions, background. ",
                "Use precise Danbooru syntax. No extra text."
            ),
            CaptionMode::Training => concat!(
                "Create a training caption for this image. Start with the main subject, then describe pose, ",
                "expression, clothing, background, and art style. Use comma-separated tags. Be specific about visual details."
            ),
        }
    }
}

impl fmt::Display for CaptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CaptionMode {
    type Err = JoyCaptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        CaptionMode::ALL
            .into_iter()
            .find(|mode| mode.name().eq_ignore_ascii_case(needle))
            .ok_or_else(|| JoyCaptionError::UnknownMode(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_modes() -> Result<(), JoyCaptionError> {
        for mode in CaptionMode::ALL {
            assert_eq!(mode.name().parse::<CaptionMode>()?, mode);
            assert_eq!(mode.to_string(), mode.name());
        }
        assert_eq!("BOORU".parse::<CaptionMode>()?, CaptionMode::Booru);
        assert_eq!(" training ".parse::<CaptionMode>()?, CaptionMode::Training);
        Ok(())
    }

    #[test]
    fn unknown_mode() {
        let err = "poetic".parse::<CaptionMode>().unwrap_err();
        assert!(matches!(err, JoyCaptionError::UnknownMode(ref m) if m == "poetic"));
        assert!(err.to_string().contains("descriptive"));
    }

    #[test]
    fn default_is_descriptive() {
        assert_eq!(CaptionMode::default(), CaptionMode::Descriptive);
        assert_eq!(
            CaptionMode::default().prompt(),
            "Write a long detailed description for this image."
        );
    }

    #[test]
    fn prompts_are_distinct() {
        let straightforward = CaptionMode::Straightforward.prompt();
        assert!(straightforward.starts_with("Write a straightforward caption for this image."));
        assert!(straightforward.ends_with("or similar phrasing."));
        assert!(straightforward.contains("\"This image is…\""));

        let booru = CaptionMode::Booru.prompt();
        assert!(booru.starts_with("Generate only comma-separated Danbooru tags"));
        assert!(booru.ends_with("No extra text."));

        assert!(CaptionMode::Training
            .prompt()
            .ends_with("Be specific about visual details."));

        let mut prompts: Vec<_> = CaptionMode::ALL.iter().map(|m| m.prompt()).collect();
        prompts.dedup();
        assert_eq!(prompts.len(), 4);
    }
}
