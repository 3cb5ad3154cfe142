use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use quick_xml::{events::Event, name::LocalName, Reader};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;
use tracing::debug;

use super::document::{PricePoint, PriceSeries};

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("market API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("market API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed market document: {0}")]
    Parse(String),
}

/// Day-ahead market price client.
///
/// One GET per day window; `url_format` carries `{token}`, `{start}` and
/// `{end}` placeholders, the period bounds being local midnights rendered as
/// 12-digit UTC `yyyymmddHHMM`.
pub struct MarketPriceClient {
    client: reqwest::Client,
    url_format: String,
    security_token: String,
    tz: Tz,
}

impl MarketPriceClient {
    pub fn new(
        url_format: String,
        security_token: String,
        user_agent: &str,
        timeout: std::time::Duration,
        tz: Tz,
    ) -> Result<Self, PriceError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("minergy")),
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            url_format,
            security_token,
            tz,
        })
    }

    /// Fetch and parse the market document for one local calendar day.
    pub async fn fetch_day(
        &self,
        date: NaiveDate,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<PriceSeries>), PriceError> {
        let (period_start, period_end) = self.day_window_utc(date);
        let url = self
            .url_format
            .replace("{token}", &self.security_token)
            .replace("{start}", &period_start.format("%Y%m%d%H%M").to_string())
            .replace("{end}", &period_end.format("%Y%m%d%H%M").to_string());

        debug!(%date, "fetching day-ahead prices");
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(PriceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_market_document(&body)
    }

    /// `[midnight local, next midnight local)` of `date`, in UTC.
    fn day_window_utc(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = local_midnight_utc(date, self.tz);
        let end = local_midnight_utc(date.succ_opt().unwrap_or(date), self.tz);
        (start, end)
    }
}

fn local_midnight_utc(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight is a valid time");
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

struct SeriesBuilder {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    resolution: Option<Duration>,
    points: Vec<PricePoint>,
    position: Option<u32>,
    amount: Option<f64>,
}

impl SeriesBuilder {
    fn new() -> Self {
        Self {
            start: None,
            end: None,
            resolution: None,
            points: Vec::new(),
            position: None,
            amount: None,
        }
    }

    fn finish_point(&mut self) -> Result<(), PriceError> {
        match (self.position.take(), self.amount.take()) {
            (Some(position), Some(amount)) => {
                self.points.push(PricePoint { position, amount });
                Ok(())
            }
            _ => Err(PriceError::Parse(
                "Point without position or price.amount".into(),
            )),
        }
    }

    fn finish(mut self) -> Result<PriceSeries, PriceError> {
        self.points.sort_by_key(|p| p.position);
        Ok(PriceSeries {
            start: self
                .start
                .ok_or_else(|| PriceError::Parse("Period without start".into()))?,
            end: self
                .end
                .ok_or_else(|| PriceError::Parse("Period without end".into()))?,
            resolution: self
                .resolution
                .ok_or_else(|| PriceError::Parse("Period without resolution".into()))?,
            points: self.points,
        })
    }
}

/// Parse a publication market document into its top-level interval and
/// time-series. Namespaces are ignored; only local element names matter.
pub fn parse_market_document(
    xml: &str,
) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<PriceSeries>), PriceError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut doc_start = None;
    let mut doc_end = None;
    let mut series: Vec<PriceSeries> = Vec::new();
    let mut current: Option<SeriesBuilder> = None;

    loop {
        match reader
            .read_event()
            .map_err(|e| PriceError::Parse(e.to_string()))?
        {
            Event::Start(e) => {
                let name = e.local_name();
                let tag = local_name_as_str(&name).to_string();
                if tag == "Period" {
                    current = Some(SeriesBuilder::new());
                }
                path.push(tag);
            }
            Event::End(e) => {
                let name = e.local_name();
                let tag = local_name_as_str(&name);
                if tag == "Period" {
                    let builder = current
                        .take()
                        .ok_or_else(|| PriceError::Parse("unbalanced Period element".into()))?;
                    series.push(builder.finish()?);
                } else if tag == "Point" {
                    if let Some(builder) = current.as_mut() {
                        builder.finish_point()?;
                    }
                }
                path.pop();
            }
            Event::Text(e) => {
                let text = e
                    .unescape()
                    .map_err(|err| PriceError::Parse(err.to_string()))?
                    .trim()
                    .to_string();
                handle_text(&path, &text, &mut doc_start, &mut doc_end, &mut current)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let interval_start =
        doc_start.ok_or_else(|| PriceError::Parse("missing period.timeInterval start".into()))?;
    let interval_end =
        doc_end.ok_or_else(|| PriceError::Parse("missing period.timeInterval end".into()))?;
    if series.is_empty() {
        debug!("market document contains no time-series");
    }
    Ok((interval_start, interval_end, series))
}

fn handle_text(
    path: &[String],
    text: &str,
    doc_start: &mut Option<DateTime<Utc>>,
    doc_end: &mut Option<DateTime<Utc>>,
    current: &mut Option<SeriesBuilder>,
) -> Result<(), PriceError> {
    if path_ends_with(path, &["period.timeInterval", "start"]) {
        *doc_start = Some(parse_instant(text)?);
    } else if path_ends_with(path, &["period.timeInterval", "end"]) {
        *doc_end = Some(parse_instant(text)?);
    } else if let Some(builder) = current.as_mut() {
        if path_ends_with(path, &["Period", "timeInterval", "start"]) {
            builder.start = Some(parse_instant(text)?);
        } else if path_ends_with(path, &["Period", "timeInterval", "end"]) {
            builder.end = Some(parse_instant(text)?);
        } else if path_ends_with(path, &["Period", "resolution"]) {
            builder.resolution = Some(parse_resolution(text)?);
        } else if path_ends_with(path, &["Point", "position"]) {
            builder.position = Some(
                text.parse()
                    .map_err(|_| PriceError::Parse(format!("bad position {text:?}")))?,
            );
        } else if path_ends_with(path, &["Point", "price.amount"]) {
            builder.amount = Some(
                text.parse()
                    .map_err(|_| PriceError::Parse(format!("bad price.amount {text:?}")))?,
            );
        }
    }
    Ok(())
}

fn path_ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

fn local_name_as_str<'a>(name: &'a LocalName<'a>) -> &'a str {
    std::str::from_utf8(name.as_ref()).unwrap_or("")
}

/// Market documents render instants as `2025-01-15T23:00Z`, occasionally
/// with seconds.
fn parse_instant(text: &str) -> Result<DateTime<Utc>, PriceError> {
    for format in ["%Y-%m-%dT%H:%MZ", "%Y-%m-%dT%H:%M:%SZ"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PriceError::Parse(format!("bad instant {text:?}")))
}

/// ISO-8601 durations as the market API emits them: PTnM, PTnH, PnD.
fn parse_resolution(text: &str) -> Result<Duration, PriceError> {
    let bad = || PriceError::Parse(format!("bad resolution {text:?}"));
    if let Some(rest) = text.strip_prefix("PT") {
        if let Some(minutes) = rest.strip_suffix('M') {
            return minutes
                .parse::<i64>()
                .map(Duration::minutes)
                .map_err(|_| bad());
        }
        if let Some(hours) = rest.strip_suffix('H') {
            return hours.parse::<i64>().map(Duration::hours).map_err(|_| bad());
        }
    }
    if let Some(days) = text.strip_prefix('P').and_then(|r| r.strip_suffix('D')) {
        return days.parse::<i64>().map(Duration::days).map_err(|_| bad());
    }
    Err(bad())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Publication_MarketDocument xmlns="urn:iec62325.351:tc57wg16:451-3:publicationdocument:7:0">
  <mRID>5a9f2e1c</mRID>
  <type>A44</type>
  <period.timeInterval>
    <start>2025-01-14T23:00Z</start>
    <end>2025-01-15T23:00Z</end>
  </period.timeInterval>
  <TimeSeries>
    <mRID>1</mRID>
    <currency_Unit.name>EUR</currency_Unit.name>
    <price_Measure_Unit.name>MWH</price_Measure_Unit.name>
    <Period>
      <timeInterval>
        <start>2025-01-14T23:00Z</start>
        <end>2025-01-15T23:00Z</end>
      </timeInterval>
      <resolution>PT60M</resolution>
      <Point><position>1</position><price.amount>86.40</price.amount></Point>
      <Point><position>2</position><price.amount>81.15</price.amount></Point>
      <Point><position>4</position><price.amount>95.00</price.amount></Point>
    </Period>
  </TimeSeries>
</Publication_MarketDocument>"#;

    #[test]
    fn parses_interval_series_and_points() {
        let (start, end, series) = parse_market_document(SAMPLE_DOCUMENT).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 1, 14, 23, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 15, 23, 0, 0).unwrap());
        assert_eq!(series.len(), 1);
        let s = &series[0];
        assert_eq!(s.resolution, Duration::minutes(60));
        assert_eq!(s.points.len(), 3);
        assert_eq!(s.points[2].position, 4);
        // Held price across the gap at position 3.
        assert_eq!(s.price_at(start + Duration::hours(2)), Some(81.15));
        assert_eq!(s.price_at(start + Duration::hours(3)), Some(95.0));
    }

    #[test]
    fn resolution_formats_are_understood() {
        assert_eq!(parse_resolution("PT15M").unwrap(), Duration::minutes(15));
        assert_eq!(parse_resolution("PT60M").unwrap(), Duration::minutes(60));
        assert_eq!(parse_resolution("PT1H").unwrap(), Duration::hours(1));
        assert_eq!(parse_resolution("P1D").unwrap(), Duration::days(1));
        assert!(parse_resolution("15 minutes").is_err());
    }

    #[test]
    fn instants_parse_with_and_without_seconds() {
        assert_eq!(
            parse_instant("2025-01-14T23:00Z").unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 14, 23, 0, 0).unwrap()
        );
        assert_eq!(
            parse_instant("2025-01-14T23:00:30Z").unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 14, 23, 0, 30).unwrap()
        );
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn missing_interval_is_rejected() {
        let xml = "<Publication_MarketDocument></Publication_MarketDocument>";
        assert!(matches!(
            parse_market_document(xml),
            Err(PriceError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn fetch_day_builds_period_bounds_from_local_midnights() {
        use wiremock::matchers::{method, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            // Prague midnight on 2025-01-15 is 23:00 UTC the previous day.
            .and(query_param("periodStart", "202501142300"))
            .and(query_param("periodEnd", "202501152300"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_DOCUMENT))
            .mount(&server)
            .await;

        let client = MarketPriceClient::new(
            format!(
                "{}/api?securityToken={{token}}&periodStart={{start}}&periodEnd={{end}}",
                server.uri()
            ),
            "t0ken".into(),
            "minergy-test",
            std::time::Duration::from_secs(5),
            "Europe/Prague".parse().unwrap(),
        )
        .unwrap();

        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let (start, _, series) = client.fetch_day(date).await.unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 1, 14, 23, 0, 0).unwrap());
        assert_eq!(series.len(), 1);
    }

    #[tokio::test]
    async fn http_errors_surface_as_status_errors() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let client = MarketPriceClient::new(
            format!("{}/api?periodStart={{start}}&periodEnd={{end}}", server.uri()),
            "t0ken".into(),
            "minergy-test",
            std::time::Duration::from_secs(5),
            "Europe/Prague".parse().unwrap(),
        )
        .unwrap();

        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        match client.fetch_day(date).await {
            Err(PriceError::Status { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
