use std::cell::RefCell;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::logger;
use crate::vision::roi::RoiSet;

pub const CHANNEL_DIR: &str = "channel_select";
pub const CHARACTER_DIR: &str = "character_select";
pub const IN_GAME_DIR: &str = "in_game";

pub const CHANNEL_ROIS: &[&str] =
    &["title", "channel_region", "button_startgame", "button_refresh", "button_endgame"];
pub const CHARACTER_ROIS: &[&str] = &["title", "character_region", "button_startgame", "button_endgame"];
pub const IN_GAME_ROIS: &[&str] = &["name_cecilia", "title_duel"];

pub type AnchorValidator = Box<dyn Fn(&Path) -> Result<()>>;

fn require_file(path: &Path, what: &str) -> Result<()> {
    if !path.is_file() {
        bail!("{} missing: {}", what, path.display());
    }
    Ok(())
}

fn require_rois(roi_path: &Path, required: &[&str]) -> Result<()> {
    let missing = RoiSet::load(roi_path)?.missing(required);
    if !missing.is_empty() {
        bail!("{} lacks ROI: {}", roi_path.display(), missing.join(", "));
    }
    Ok(())
}

pub fn channel_template(root: &Path, index: u32) -> PathBuf {
    root.join(CHANNEL_DIR).join(format!("channel_{}.png", index))
}

pub fn validate_channel_root(root: &Path, channels: u32) -> Result<()> {
    let dir = root.join(CHANNEL_DIR);
    require_file(&dir.join("title.png"), "channel title template")?;
    require_file(&dir.join("roi.json"), "channel ROI file")?;
    require_rois(&dir.join("roi.json"), CHANNEL_ROIS)?;
    for i in 1..=channels {
        require_file(&channel_template(root, i), "channel template")?;
    }
    Ok(())
}

pub fn validate_character_root(root: &Path) -> Result<()> {
    let dir = root.join(CHARACTER_DIR);
    require_file(&dir.join("title.png"), "character title template")?;
    require_file(&dir.join("roi.json"), "character ROI file")?;
    require_file(&dir.join("character_1.png"), "character template")?;
    require_rois(&dir.join("roi.json"), CHARACTER_ROIS)
}

pub fn validate_in_game_root(root: &Path) -> Result<()> {
    let dir = root.join(IN_GAME_DIR);
    require_file(&dir.join("roi.json"), "in-game ROI file")?;
    require_file(&dir.join("name_cecilia.png"), "in-game template")?;
    require_file(&dir.join("title_duel.png"), "in-game template")?;
    require_rois(&dir.join("roi.json"), IN_GAME_ROIS)
}

/// Picks the anchor root for the current window size: `<root>/<W>x<H>` when present and
/// valid, else the default root. The choice is cached until the size changes.
pub struct AnchorResolver {
    stage: String,
    default_root: PathBuf,
    validator: AnchorValidator,
    last: RefCell<Option<((i32, i32), PathBuf)>>,
}

impl AnchorResolver {
    pub fn new(stage: &str, default_root: &Path, validator: AnchorValidator) -> Self {
        Self {
            stage: stage.to_string(),
            default_root: default_root.to_path_buf(),
            validator,
            last: RefCell::new(None),
        }
    }

    pub fn channel(default_root: &Path, channels: u32) -> Self {
        Self::new("channel", default_root, Box::new(move |root| validate_channel_root(root, channels)))
    }

    pub fn character(default_root: &Path) -> Self {
        Self::new("character", default_root, Box::new(validate_character_root))
    }

    pub fn in_game(default_root: &Path) -> Self {
        Self::new("in_game", default_root, Box::new(validate_in_game_root))
    }

    pub fn resolve(&self, size: (i32, i32)) -> Result<PathBuf> {
        if let Some((last_size, root)) = self.last.borrow().as_ref() {
            if *last_size == size {
                return Ok(root.clone());
            }
        }
        let (width, height) = size;
        let candidate = self.default_root.join(format!("{}x{}", width, height));
        let root = if candidate.is_dir() {
            match (self.validator)(&candidate) {
                Ok(()) => {
                    logger::info_p(
                        "anchors",
                        &format!("{} size {}x{}, using {}", self.stage, width, height, candidate.display()),
                    );
                    candidate
                }
                Err(e) => {
                    logger::error_p(
                        "anchors",
                        &format!("{} size {}x{}, anchors unusable: {}, using default", self.stage, width, height, e),
                    );
                    (self.validator)(&self.default_root)?;
                    self.default_root.clone()
                }
            }
        } else {
            logger::warn_p(
                "anchors",
                &format!("{} size {}x{}, no {}, using default", self.stage, width, height, candidate.display()),
            );
            (self.validator)(&self.default_root)?;
            self.default_root.clone()
        };
        *self.last.borrow_mut() = Some((size, root.clone()));
        Ok(root)
    }
}
