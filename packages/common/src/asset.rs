#[cfg(feature = "sea-orm")]
use sea_orm::prelude::StringLen;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every kind of file or dataset the catalog tracks, raw or derived.
///
/// When the `sea-orm` feature is enabled, this enum can be used directly in SeaORM entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    /// NovAtel binary receiver log.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "novatel"))]
    Novatel,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "novatel770"))]
    Novatel770,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "novatel000"))]
    Novatel000,
    /// Waveglider acoustic ranging log.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "dfop00"))]
    Dfop00,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "sonardyne"))]
    Sonardyne,
    /// Averaged sound velocity profile from a Seabird cast.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "seabird"))]
    Seabird,
    /// Two column depth/velocity cast.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "ctd"))]
    Ctd,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "leverarm"))]
    LeverArm,
    /// Site master file.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "master"))]
    Master,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "qcpin"))]
    QcPin,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "bcoffload"))]
    BcOffload,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "rinex"))]
    Rinex,
    /// Kinematic GNSS solution.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "kin"))]
    Kin,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "novatelpin"))]
    NovatelPin,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "kinresiduals"))]
    KinResiduals,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "kinposition"))]
    KinPosition,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "acoustic"))]
    Acoustic,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "imuposition"))]
    ImuPosition,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "shotdata"))]
    ShotData,
    /// Sound velocity profile table.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "svp"))]
    Svp,
    /// GNSS observables array.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "gnssobstdb"))]
    GnssObsTdb,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "siteconfig"))]
    SiteConfig,
    /// Antenna-transducer offset.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "atdoffset"))]
    AtdOffset,
}

/// How a derived asset of a given type is persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetCategory {
    /// Instrument output as ingested; never produced by a transform.
    Raw,
    /// A file written by the transform itself (RINEX, kinematic solutions).
    File,
    /// Rows appended to the time-indexed array store.
    Tabular,
    /// A JSON document written next to the processed data.
    SideCar,
}

impl AssetType {
    /// All asset types.
    pub const ALL: &'static [AssetType] = &[
        Self::Novatel,
        Self::Novatel770,
        Self::Novatel000,
        Self::Dfop00,
        Self::Sonardyne,
        Self::Seabird,
        Self::Ctd,
        Self::LeverArm,
        Self::Master,
        Self::QcPin,
        Self::BcOffload,
        Self::Rinex,
        Self::Kin,
        Self::NovatelPin,
        Self::KinResiduals,
        Self::KinPosition,
        Self::Acoustic,
        Self::ImuPosition,
        Self::ShotData,
        Self::Svp,
        Self::GnssObsTdb,
        Self::SiteConfig,
        Self::AtdOffset,
    ];

    /// Types fetched by a download run when the caller names none.
    pub const DEFAULT_DOWNLOADS: &'static [AssetType] = &[
        Self::Sonardyne,
        Self::Novatel000,
        Self::Novatel770,
        Self::Dfop00,
        Self::Ctd,
        Self::Seabird,
    ];

    /// Returns the string representation stored in the catalog.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Novatel => "novatel",
            Self::Novatel770 => "novatel770",
            Self::Novatel000 => "novatel000",
            Self::Dfop00 => "dfop00",
            Self::Sonardyne => "sonardyne",
            Self::Seabird => "seabird",
            Self::Ctd => "ctd",
            Self::LeverArm => "leverarm",
            Self::Master => "master",
            Self::QcPin => "qcpin",
            Self::BcOffload => "bcoffload",
            Self::Rinex => "rinex",
            Self::Kin => "kin",
            Self::NovatelPin => "novatelpin",
            Self::KinResiduals => "kinresiduals",
            Self::KinPosition => "kinposition",
            Self::Acoustic => "acoustic",
            Self::ImuPosition => "imuposition",
            Self::ShotData => "shotdata",
            Self::Svp => "svp",
            Self::GnssObsTdb => "gnssobstdb",
            Self::SiteConfig => "siteconfig",
            Self::AtdOffset => "atdoffset",
        }
    }

    pub fn category(&self) -> AssetCategory {
        match self {
            Self::Novatel
            | Self::Novatel770
            | Self::Novatel000
            | Self::Dfop00
            | Self::Sonardyne
            | Self::Seabird
            | Self::Ctd
            | Self::LeverArm
            | Self::Master
            | Self::QcPin
            | Self::BcOffload => AssetCategory::Raw,
            Self::Rinex | Self::Kin | Self::NovatelPin | Self::KinResiduals => AssetCategory::File,
            Self::KinPosition
            | Self::Acoustic
            | Self::ImuPosition
            | Self::ShotData
            | Self::Svp
            | Self::GnssObsTdb => AssetCategory::Tabular,
            Self::SiteConfig | Self::AtdOffset => AssetCategory::SideCar,
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error when parsing an unknown asset type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAssetTypeError {
    invalid: String,
}

impl fmt::Display for ParseAssetTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid asset type '{}'. Valid values: {}",
            self.invalid,
            AssetType::ALL
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

impl std::error::Error for ParseAssetTypeError {}

impl FromStr for AssetType {
    type Err = ParseAssetTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        // "nov770" is how older archives name NovAtel 770 logs.
        if lowered == "nov770" {
            return Ok(Self::Novatel770);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == lowered)
            .ok_or(ParseAssetTypeError {
                invalid: s.to_string(),
            })
    }
}

/// Where the bytes of a remote asset live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// Object store reference, `s3://bucket/key` or `bucket/key`.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "s3"))]
    S3,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "http"))]
    Http,
}

impl RemoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "http" | "https" => Ok(Self::Http),
            _ => Err(format!(
                "Invalid remote kind '{}'. Must be 's3' or 'http'",
                s
            )),
        }
    }
}

/// The (network, station, survey) partition every asset belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub network: String,
    pub station: String,
    pub survey: String,
}

impl Scope {
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        survey: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            station: station.into(),
            survey: survey.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.network, self.station, self.survey)
    }
}

/// Inclusive data-time range covered by an asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeBounds {
    /// Build bounds from two instants in either order.
    pub fn new(a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    /// Smallest range covering both `self` and `other`.
    pub fn widen(&self, other: &TimeBounds) -> TimeBounds {
        TimeBounds {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn contains(&self, other: &TimeBounds) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Bounds spanning every instant yielded by `times`, or `None` when empty.
    pub fn spanning<I>(times: I) -> Option<TimeBounds>
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        times.into_iter().fold(None, |acc, t| match acc {
            None => Some(TimeBounds { start: t, end: t }),
            Some(b) => Some(b.widen(&TimeBounds { start: t, end: t })),
        })
    }
}
