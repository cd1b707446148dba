//! Forecast products: schedules, cycles and file naming.
//!
//! Each model is a [`ModelDefinition`], pure data. The built-in table covers
//! GFS and the two ECMWF products; further models can be declared in the
//! workflow config without code changes.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use nwp_common::time::check_on_the_hour;
use nwp_common::{Locator, NwpError, NwpResult, ValidTime};

use crate::files::LocatorBuilder;
use crate::schedule::{ScheduleInterval, ScheduleRule};

/// A forecast model and how its files are laid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    /// Cycle hours (UTC) the model runs at.
    pub cycles: Vec<u32>,
    #[serde(rename = "intervals")]
    pub schedule: ScheduleRule,
    /// Absolute locator template for source files.
    pub source_template: String,
    /// Template relative to the destination root.
    pub destination_template: String,
}

const GFS_SOURCE: &str =
    "gs://{bucket}/gfs.{date}/{cycle:02}/atmos/gfs.t{cycle:02}z.pgrb2.{resolution}.f{lead:03}";
const GFS_DESTINATION: &str =
    "gfs/{resolution}/{date}/{cycle:02}/gfs.t{cycle:02}z.pgrb2.{resolution}.f{lead:03}";

impl ModelDefinition {
    pub fn gfs() -> NwpResult<Self> {
        Ok(Self {
            id: "gfs".to_string(),
            cycles: vec![0, 6, 12, 18],
            schedule: ScheduleRule::new(vec![
                ScheduleInterval::new(0, 120, 1),
                ScheduleInterval::new(120, 240, 3),
                ScheduleInterval::new(240, 384, 12),
            ])?,
            source_template: GFS_SOURCE.to_string(),
            destination_template: GFS_DESTINATION.to_string(),
        })
    }

    pub fn ecmwf_hres() -> NwpResult<Self> {
        Self::ecmwf(
            "hres",
            &[
                ScheduleInterval::new(0, 90, 1),
                ScheduleInterval::new(90, 240, 3),
            ],
        )
    }

    pub fn ecmwf_ens() -> NwpResult<Self> {
        Self::ecmwf(
            "ens",
            &[
                ScheduleInterval::new(0, 144, 3),
                ScheduleInterval::new(144, 360, 6),
            ],
        )
    }

    fn ecmwf(kind: &str, intervals: &[ScheduleInterval]) -> NwpResult<Self> {
        Ok(Self {
            id: format!("ecmwf-{}", kind),
            cycles: vec![0, 12],
            schedule: ScheduleRule::new(intervals.to_vec())?,
            source_template: format!(
                "gs://{{bucket}}/ecmwf/{kind}/{{date}}/{{cycle:02}}/{{resolution}}/\
                 ecmwf.{kind}.{{cycle:02}}z.{{resolution}}.f{{lead:03}}.grib"
            ),
            destination_template: format!(
                "ecmwf/{kind}/{{resolution}}/{{date}}/{{cycle:02}}/\
                 ecmwf.{kind}.{{cycle:02}}z.{{resolution}}.f{{lead:03}}.grib"
            ),
        })
    }

    pub fn builtins() -> NwpResult<Vec<Self>> {
        Ok(vec![Self::gfs()?, Self::ecmwf_hres()?, Self::ecmwf_ens()?])
    }

    /// Find a model by id, preferring `custom` definitions over built-ins.
    pub fn lookup(id: &str, custom: &[ModelDefinition]) -> NwpResult<Self> {
        if let Some(model) = custom.iter().find(|m| m.id == id) {
            return Ok(model.clone());
        }
        Self::builtins()?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| NwpError::InvalidConfig(format!("unknown product '{}'", id)))
    }

    pub fn max_horizon(&self) -> u32 {
        self.schedule.max_horizon()
    }

    /// Check that `cycle` is on the hour and at one of this model's run hours.
    pub fn validate_cycle(&self, cycle: &DateTime<Utc>) -> NwpResult<()> {
        check_on_the_hour(cycle)?;
        if !self.cycles.contains(&cycle.hour()) {
            return Err(NwpError::InvalidCycle(format!(
                "{} runs at {:?}Z, not {:02}Z",
                self.id,
                self.cycles,
                cycle.hour()
            )));
        }
        Ok(())
    }
}

/// Fill a locator template for one file.
fn render(template: &str, bucket: &str, cycle: &DateTime<Utc>, resolution: &str, lead: u32) -> NwpResult<String> {
    let rendered = template
        .replace("{bucket}", bucket)
        .replace("{date}", &cycle.format("%Y%m%d").to_string())
        .replace("{cycle:02}", &format!("{:02}", cycle.hour()))
        .replace("{lead:03}", &format!("{:03}", lead))
        .replace("{resolution}", resolution);

    if let Some(start) = rendered.find('{') {
        let end = rendered[start..].find('}').map(|i| start + i + 1).unwrap_or(rendered.len());
        return Err(NwpError::InvalidConfig(format!(
            "unknown placeholder {} in template '{}'",
            &rendered[start..end],
            template
        )));
    }
    Ok(rendered)
}

/// Source and destination locators for every file of one model cycle.
#[derive(Debug, Clone)]
pub struct CycleLocators {
    model: ModelDefinition,
    cycle: DateTime<Utc>,
    resolution: String,
    source_bucket: String,
    destination_root: Locator,
}

impl CycleLocators {
    /// Validates the cycle and both templates up front so later lookups
    /// only fail on genuinely bad input.
    pub fn new(
        model: ModelDefinition,
        cycle: DateTime<Utc>,
        resolution: impl Into<String>,
        source_bucket: impl Into<String>,
        destination_root: Locator,
    ) -> NwpResult<Self> {
        model.validate_cycle(&cycle)?;
        let locators = Self {
            model,
            cycle,
            resolution: resolution.into(),
            source_bucket: source_bucket.into(),
            destination_root,
        };
        locators.source(0)?;
        locators.destination(0)?;
        Ok(locators)
    }

    pub fn model(&self) -> &ModelDefinition {
        &self.model
    }

    pub fn cycle(&self) -> DateTime<Utc> {
        self.cycle
    }

    pub fn destination_root(&self) -> &Locator {
        &self.destination_root
    }

    fn render(&self, template: &str, lead: u32) -> NwpResult<String> {
        render(template, &self.source_bucket, &self.cycle, &self.resolution, lead)
    }
}

impl LocatorBuilder for CycleLocators {
    fn source(&self, offset: u32) -> NwpResult<Locator> {
        self.render(&self.model.source_template, offset)?.parse()
    }

    fn destination(&self, offset: u32) -> NwpResult<Locator> {
        let rel = self.render(&self.model.destination_template, offset)?;
        Ok(self.destination_root.join(&rel))
    }

    fn valid_time(&self, offset: u32) -> Option<DateTime<Utc>> {
        Some(ValidTime::new(self.cycle, offset).valid_datetime())
    }
}
