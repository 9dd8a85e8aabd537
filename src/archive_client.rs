// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

use canonical_error::{CanonicalError, data_loss_error, deadline_exceeded_error,
                      invalid_argument_error, unavailable_error};
use log::{debug, info};

use skystack_elements::astro_util::CelestialLocation;

/// One exposure row returned by an archive query. Transient; never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct ExposureRecord {
    pub location: CelestialLocation,
    pub url: String,
    pub instrument: String,
}

/// Archive data product kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProductType {
    Best,
    Exposure,
    Combined,
    Mosaic,
    Color,
    Hlsp,
    All,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Best => "best",
            ProductType::Exposure => "exposure",
            ProductType::Combined => "combined",
            ProductType::Mosaic => "mosaic",
            ProductType::Color => "color",
            ProductType::Hlsp => "HLSP",
            ProductType::All => "all",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = CanonicalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best" => Ok(ProductType::Best),
            "exposure" => Ok(ProductType::Exposure),
            "combined" => Ok(ProductType::Combined),
            "mosaic" => Ok(ProductType::Mosaic),
            "color" => Ok(ProductType::Color),
            "hlsp" => Ok(ProductType::Hlsp),
            "all" => Ok(ProductType::All),
            _ => Err(invalid_argument_error(
                format!("Unknown product type '{}'", s).as_str())),
        }
    }
}

// Resolves sky positions into exposure records and fetches exposure bytes.
// Errors:
//   InvalidArgument: the query parameters are malformed or were rejected by
//     the archive. Retrying cannot help.
//   Unavailable, DeadlineExceeded: network trouble; the same request may
//     succeed later.
//   DataLoss: the archive answered with something that cannot be parsed.
pub trait ArchiveClient {
    // Rows are returned in archive order. Zero rows is not an error.
    fn query(&self, location: &CelestialLocation, radius_deg: f64,
             product: ProductType, instrument: &str)
             -> Result<Vec<ExposureRecord>, CanonicalError>;

    // Any non-success HTTP status is reported as Unavailable.
    fn download(&self, url: &str) -> Result<Vec<u8>, CanonicalError>;
}

/// Checks query parameters before anything is sent.
pub fn validate_query(location: &CelestialLocation, radius_deg: f64, instrument: &str)
                      -> Result<(), CanonicalError> {
    if !(0.0..=360.0).contains(&location.ra) {
        return Err(invalid_argument_error(
            format!("Right ascension {} outside [0, 360]", location.ra).as_str()));
    }
    if !(-90.0..=90.0).contains(&location.dec) {
        return Err(invalid_argument_error(
            format!("Declination {} outside [-90, 90]", location.dec).as_str()));
    }
    if !(radius_deg > 0.0 && radius_deg <= 180.0) {
        return Err(invalid_argument_error(
            format!("Search radius {} outside (0, 180]", radius_deg).as_str()));
    }
    if instrument.is_empty() ||
        !instrument.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '/')
    {
        return Err(invalid_argument_error(
            format!("Bad instrument name '{}'", instrument).as_str()));
    }
    Ok(())
}

pub const HLA_SIAP_URL: &str = "https://hla.stsci.edu/cgi-bin/hlaSIAP.cgi";

#[derive(Clone, Debug)]
pub struct HlaQueryParams {
    // Filter identifiers, joined with commas. Empty means no filter selection.
    pub spectral_elements: Vec<String>,

    // Percentage of the image histogram to retain.
    pub autoscale: f64,

    // Nonzero selects the Lupton asinh contrast algorithm.
    pub asinh: u32,

    // Overall limit for one query or download.
    pub timeout: Duration,
}

impl Default for HlaQueryParams {
    fn default() -> Self {
        HlaQueryParams{
            spectral_elements: Vec::new(),
            autoscale: 99.5,
            asinh: 1,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Hubble Legacy Archive client using the SIAP VOTable endpoint.
pub struct HlaArchiveClient {
    agent: ureq::Agent,
    base_url: String,
    params: HlaQueryParams,
}

impl HlaArchiveClient {
    pub fn new(params: HlaQueryParams) -> Self {
        Self::with_base_url(HLA_SIAP_URL, params)
    }

    pub fn with_base_url(base_url: &str, params: HlaQueryParams) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(params.timeout))
            .build();
        HlaArchiveClient{
            agent: ureq::Agent::new_with_config(config),
            base_url: base_url.to_string(),
            params,
        }
    }

    /// Builds the query URL, validating the parameters first. A search of
    /// radius 180 around (0, 0) covers the whole sky.
    pub fn query_url(&self, location: &CelestialLocation, radius_deg: f64,
                     product: ProductType, instrument: &str)
                     -> Result<String, CanonicalError> {
        validate_query(location, radius_deg, instrument)?;
        let all_sky = location.ra == 0.0 && location.dec == 0.0 && radius_deg == 180.0;
        let mut url = if all_sky {
            format!("{}?POS=0,0&size=180", self.base_url)
        } else {
            format!("{}?POS={},{}&size={}", self.base_url,
                    location.ra, location.dec, radius_deg)
        };
        url.push_str(&format!("&imagetype={}&inst={}&format=image/jpeg&autoscale={}&asinh={}",
                              product, instrument,
                              self.params.autoscale, self.params.asinh));
        if !self.params.spectral_elements.is_empty() {
            url.push_str(&format!("&spectral_elt={}",
                                  self.params.spectral_elements.join(",")));
        }
        Ok(url)
    }

    fn get(&self, url: &str) -> Result<ureq::http::Response<ureq::Body>, CanonicalError> {
        self.agent.get(url).call().map_err(|e| transport_error(url, e))
    }
}

fn transport_error(url: &str, e: ureq::Error) -> CanonicalError {
    let message = format!("Request {} failed: {}", url, e);
    match e {
        ureq::Error::Timeout(_) => deadline_exceeded_error(message.as_str()),
        ureq::Error::BadUri(_) => invalid_argument_error(message.as_str()),
        _ => unavailable_error(message.as_str()),
    }
}

impl ArchiveClient for HlaArchiveClient {
    fn query(&self, location: &CelestialLocation, radius_deg: f64,
             product: ProductType, instrument: &str)
             -> Result<Vec<ExposureRecord>, CanonicalError> {
        let url = self.query_url(location, radius_deg, product, instrument)?;
        debug!("Querying {}", url);
        let response = self.get(&url)?;
        let body = response.into_body().read_to_string().map_err(
            |e| unavailable_error(format!("Reading query response failed: {}", e).as_str()))?;
        let records = parse_votable(&body, instrument)?;
        info!("Query at {} returned {} rows", location, records.len());
        Ok(records)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, CanonicalError> {
        let response = self.get(url)?;
        let mut reader = response.into_body().into_reader();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).map_err(
            |e| unavailable_error(format!("Download of {} interrupted: {}", url, e).as_str()))?;
        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes)
    }
}

// Returns the value of attribute `name` within an element's opening tag text.
fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", name);
    let lower = tag.to_ascii_lowercase();
    let start = lower.find(&needle.to_ascii_lowercase())? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(&tag[start..end])
}

// Cell text with CDATA unwrapped or entities decoded.
fn cell_text(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(cdata) = trimmed.strip_prefix("<![CDATA[") {
        return cdata.strip_suffix("]]>").unwrap_or(cdata).to_string();
    }
    trimmed.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

// Splits one <TR> body into its <TD> cell texts.
fn row_cells(row: &str) -> Vec<String> {
    row.split("<TD").skip(1).map(|cell| {
        if cell.trim_start().starts_with("/>") {
            return String::new();
        }
        let content_start = cell.find('>').map(|i| i + 1).unwrap_or(cell.len());
        let content = &cell[content_start..];
        let content_end = content.find("</TD>").unwrap_or(content.len());
        cell_text(&content[..content_end])
    }).collect()
}

/// Parses an archive VOTable into exposure records. `RA`, `DEC` and `URL`
/// columns are located by FIELD name. `default_instrument` is used when the
/// table carries no instrument column.
pub fn parse_votable(votable: &str, default_instrument: &str)
                     -> Result<Vec<ExposureRecord>, CanonicalError> {
    for info in votable.split("<INFO").skip(1) {
        let tag = info.split('>').next().unwrap_or("");
        if attribute(tag, "name").map(|n| n.eq_ignore_ascii_case("QUERY_STATUS")) == Some(true) &&
            attribute(tag, "value").map(|v| v.eq_ignore_ascii_case("ERROR")) == Some(true)
        {
            let detail = info.split_once('>')
                .map(|(_, rest)| rest.split("</INFO>").next().unwrap_or("").trim())
                .unwrap_or("");
            return Err(invalid_argument_error(
                format!("Archive rejected query: {}", cell_text(detail)).as_str()));
        }
    }

    let tabledata_start = match votable.find("<TABLEDATA>") {
        Some(start) => start,
        None => { return Ok(Vec::new()); }
    };
    let tabledata_end = votable.find("</TABLEDATA>").ok_or_else(
        || data_loss_error("Unterminated TABLEDATA in VOTable"))?;

    let names: Vec<String> = votable[..tabledata_start]
        .split("<FIELD")
        .skip(1)
        .filter(|s| s.starts_with(|c: char| c.is_whitespace()))
        .map(|s| s.split('>').next().unwrap_or(""))
        .map(|tag| attribute(tag, "name").unwrap_or("").to_string())
        .collect();
    let column = |wanted: &str| names.iter().position(|n| n.eq_ignore_ascii_case(wanted));
    let (ra_idx, dec_idx, url_idx) = match (column("RA"), column("DEC"), column("URL")) {
        (Some(r), Some(d), Some(u)) => (r, d, u),
        _ => {
            return Err(data_loss_error(
                format!("VOTable lacks RA/DEC/URL fields, has {:?}", names).as_str()));
        }
    };
    let instrument_idx = column("Instrument").or_else(|| column("Detector"));

    let tabledata = &votable[tabledata_start..tabledata_end];
    let mut records = Vec::new();
    for row in tabledata.split("<TR").skip(1) {
        let row_end = row.find("</TR>").unwrap_or(row.len());
        let cells = row_cells(&row[..row_end]);
        let cell = |idx: usize| cells.get(idx).map(|s| s.as_str()).unwrap_or("");
        let ra: f64 = cell(ra_idx).parse().map_err(|_| data_loss_error(
            format!("Bad RA value '{}'", cell(ra_idx)).as_str()))?;
        let dec: f64 = cell(dec_idx).parse().map_err(|_| data_loss_error(
            format!("Bad DEC value '{}'", cell(dec_idx)).as_str()))?;
        let url = cell(url_idx);
        if url.is_empty() {
            return Err(data_loss_error("Row without URL in VOTable"));
        }
        let instrument = match instrument_idx.map(cell) {
            Some(i) if !i.is_empty() => i.to_string(),
            _ => default_instrument.to_string(),
        };
        records.push(ExposureRecord{
            location: CelestialLocation::new(ra, dec),
            url: url.to_string(),
            instrument,
        });
    }
    Ok(records)
}

// mod tests.
