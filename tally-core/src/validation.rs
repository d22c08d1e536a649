//! Input validation for item writes.
//!
//! Limits mirror the column widths of the `blog` table so oversized input
//! is rejected before reaching the durable store.

use crate::constants::{
    CONTENT_MAX_LEN, CONTENT_MIN_LEN, EXCERPT_MAX_LEN, IMAGE_MAX_LEN, TITLE_MAX_LEN,
    TITLE_MIN_LEN,
};
use crate::error::ValidationError;
use crate::item::{ItemUpdate, NewItem};

fn check_length(field: &str, value: &str, min: usize, max: usize) -> Result<(), ValidationError> {
    let actual = value.chars().count();
    if actual < min || actual > max {
        return Err(ValidationError::InvalidLength {
            field: field.to_string(),
            min,
            max,
            actual,
        });
    }
    Ok(())
}

impl NewItem {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_length("title", &self.title, TITLE_MIN_LEN, TITLE_MAX_LEN)?;
        check_length("content", &self.content, CONTENT_MIN_LEN, CONTENT_MAX_LEN)?;
        if let Some(excerpt) = &self.excerpt {
            check_length("excerpt", excerpt, 0, EXCERPT_MAX_LEN)?;
        }
        if let Some(image) = &self.image {
            check_length("image", image, 0, IMAGE_MAX_LEN)?;
        }
        Ok(())
    }
}

impl ItemUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(title) = &self.title {
            check_length("title", title, TITLE_MIN_LEN, TITLE_MAX_LEN)?;
        }
        if let Some(content) = &self.content {
            check_length("content", content, CONTENT_MIN_LEN, CONTENT_MAX_LEN)?;
        }
        if let Some(excerpt) = &self.excerpt {
            check_length("excerpt", excerpt, 0, EXCERPT_MAX_LEN)?;
        }
        if let Some(image) = &self.image {
            check_length("image", image, 0, IMAGE_MAX_LEN)?;
        }
        if let Some(view_count) = self.view_count {
            if view_count < 0 {
                return Err(ValidationError::InvalidValue {
                    field: "viewCount".to_string(),
                    reason: format!("must be non-negative, got {view_count}"),
                });
            }
            if view_count > i64::from(i32::MAX) {
                return Err(ValidationError::InvalidValue {
                    field: "viewCount".to_string(),
                    reason: format!("must fit a 32-bit column, got {view_count}"),
                });
            }
        }
        Ok(())
    }
}
