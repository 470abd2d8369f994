//! Semantic frame roles.
//!
//! Tags partition the frame universe: the database keeps each file under
//! exactly one tag. The string forms are the section names of the database
//! file and must stay stable.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    Bias,
    MasterBias,
    SpecFlat,
    FlatCombined,
    FlatNormalized,
    Arc,
    ArcCorrected,
    FluxStandard,
    Response,
    ScienceObject,
    ImagingFlat,
    ImagingObject,
}

impl Tag {
    pub const ALL: [Tag; 12] = [
        Tag::Bias,
        Tag::MasterBias,
        Tag::SpecFlat,
        Tag::FlatCombined,
        Tag::FlatNormalized,
        Tag::Arc,
        Tag::ArcCorrected,
        Tag::FluxStandard,
        Tag::Response,
        Tag::ScienceObject,
        Tag::ImagingFlat,
        Tag::ImagingObject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Bias => "BIAS",
            Tag::MasterBias => "MBIAS",
            Tag::SpecFlat => "SPEC_FLAT",
            Tag::FlatCombined => "SFLAT",
            Tag::FlatNormalized => "NORM_SFLAT",
            Tag::Arc => "ARC",
            Tag::ArcCorrected => "ARC_CORR",
            Tag::FluxStandard => "SPEC_FLUX-STD",
            Tag::Response => "RESPONSE",
            Tag::ScienceObject => "SPEC_OBJECT",
            Tag::ImagingFlat => "IMG_FLAT",
            Tag::ImagingObject => "IMG_OBJECT",
        }
    }

    /// Products written by the pipeline rather than found on disk.
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            Tag::MasterBias
                | Tag::FlatCombined
                | Tag::FlatNormalized
                | Tag::ArcCorrected
                | Tag::Response
        )
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tag::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown tag {:?}", s))
    }
}
