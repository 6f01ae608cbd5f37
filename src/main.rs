use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use itertools::Itertools;
use palette::{LinSrgb, Mix, Srgb};
use serde::{Deserialize, Serialize};
use structopt::StructOpt;

use plotters::prelude::*;

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const CONFIRMED_CSV: &str = "time_series_19-covid-Confirmed.csv";
const DEATHS_CSV: &str = "time_series_19-covid-Deaths.csv";
const RECOVERED_CSV: &str = "time_series_19-covid-Recovered.csv";
const CLEANED_CSV: &str = "covid-19-cleaned.csv";

const SPREAD_PNG: &str = "cases_over_time.png";
const STATUS_PNG: &str = "countries_confirmed.png";

// Shared metric colors, matching the usual reporting conventions
const DEATHS_RED: RGBColor = RGBColor(0xff, 0x00, 0x00);
const RECOVERED_GREEN: RGBColor = RGBColor(0x33, 0xcc, 0x00);
const ACTIVE_YELLOW: RGBColor = RGBColor(0xff, 0xd3, 0x00);
const CONFIRMED_BLUE: RGBColor = RGBColor(0xad, 0xd8, 0xe6);

// JHU date headers look like "1/22/20"
const WIDE_DATE_FORMAT: &str = "%m/%d/%y";

#[derive(Debug, StructOpt)]
#[structopt(
    name = "covidviz",
    about = "Clean the JHU covid-19 time series and render charts from it"
)]
struct Opt {
    #[structopt(
        long,
        default_value = "datasets",
        help = "Directory holding the three wide-format time series CSVs"
    )]
    data_dir: PathBuf,
    #[structopt(
        long,
        default_value = ".",
        help = "Directory the cleaned CSV and chart images are written to"
    )]
    out_dir: PathBuf,
}

/// One observation of the cleaned long-format table: a single region on a
/// single date, with cumulative counts for every metric.
///
/// `active` is derived as confirmed minus deaths minus recovered and is not
/// clamped, so inconsistent source data can push it below zero.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CaseRecord {
    #[serde(rename = "Province/State")]
    province: String,
    #[serde(rename = "Country/Region")]
    country: String,
    #[serde(rename = "Lat")]
    lat: f64,
    #[serde(rename = "Long")]
    long: f64,
    #[serde(rename = "Date")]
    #[serde(with = "Ymd_dash_date_format")]
    date: NaiveDate,
    #[serde(rename = "Confirmed")]
    confirmed: i64,
    #[serde(rename = "Deaths")]
    deaths: i64,
    #[serde(rename = "Recovered")]
    recovered: i64,
    #[serde(rename = "Active")]
    active: i64,
}

#[allow(non_snake_case)]
mod Ymd_dash_date_format {
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d";
    pub fn serialize<S>(nd: &chrono::NaiveDate, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = format!("{}", nd.format(FORMAT));
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<chrono::NaiveDate, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        chrono::NaiveDate::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Metric {
    Confirmed,
    Deaths,
    Recovered,
    Active,
}

impl Metric {
    fn label(self) -> &'static str {
        match self {
            Metric::Confirmed => "Confirmed",
            Metric::Deaths => "Deaths",
            Metric::Recovered => "Recovered",
            Metric::Active => "Active",
        }
    }

    fn color(self) -> RGBColor {
        match self {
            Metric::Confirmed => CONFIRMED_BLUE,
            Metric::Deaths => DEATHS_RED,
            Metric::Recovered => RECOVERED_GREEN,
            Metric::Active => ACTIVE_YELLOW,
        }
    }

    fn of(self, totals: &ProvinceTotals) -> i64 {
        match self {
            Metric::Confirmed => totals.confirmed,
            Metric::Deaths => totals.deaths,
            Metric::Recovered => totals.recovered,
            Metric::Active => totals.active,
        }
    }
}

/// Display settings for one of the per-province bar charts. `headroom` pads
/// the value axis past the series maximum so the outside labels fit.
struct BarSpec {
    metric: Metric,
    title: &'static str,
    file: &'static str,
    headroom: i64,
}

const CHINA_BARS: [BarSpec; 4] = [
    BarSpec {
        metric: Metric::Confirmed,
        title: "Top 20 Confirmed Cases in China",
        file: "china_confirmed.png",
        headroom: 10_000,
    },
    BarSpec {
        metric: Metric::Active,
        title: "Top 20 Active Cases in China",
        file: "china_active.png",
        headroom: 5_000,
    },
    BarSpec {
        metric: Metric::Deaths,
        title: "Top 20 Deaths from Covid-19 in China",
        file: "china_deaths.png",
        headroom: 500,
    },
    BarSpec {
        metric: Metric::Recovered,
        title: "Top 20 Recovered from Covid-19 in China",
        file: "china_recovered.png",
        headroom: 10_000,
    },
];

/// A wide-format time series as published by JHU CSSE: four identity
/// columns, then one cumulative count column per date.
#[derive(Debug, Clone, PartialEq)]
struct WideTable {
    dates: Vec<NaiveDate>,
    rows: Vec<WideRow>,
}

#[derive(Debug, Clone, PartialEq)]
struct WideRow {
    province: String,
    country: String,
    lat: f64,
    long: f64,
    counts: Vec<i64>,
}

/// Parse one wide-format CSV. A missing file is reported on stdout and
/// returned as `None` so the caller decides how hard to fail; every other
/// fault is an error.
fn load_wide(path: &Path) -> Result<Option<WideTable>> {
    let infile = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("Invalid path given: {}", path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("opening {}", path.display()));
        }
    };
    let mut rdr = csv::Reader::from_reader(infile);
    let headers = rdr
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .clone();
    if headers.len() < 5 {
        bail!(
            "{}: expected 4 id columns plus at least one date column, got {}",
            path.display(),
            headers.len()
        );
    }
    let dates = headers
        .iter()
        .skip(4)
        .map(|h| {
            NaiveDate::parse_from_str(h, WIDE_DATE_FORMAT)
                .with_context(|| format!("{}: bad date column {:?}", path.display(), h))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec.with_context(|| format!("reading {}", path.display()))?;
        let line = rec.position().map_or(0, |p| p.line());
        rows.push(
            parse_wide_row(&rec, dates.len())
                .with_context(|| format!("{} line {}", path.display(), line))?,
        );
    }
    Ok(Some(WideTable { dates, rows }))
}

fn parse_wide_row(rec: &csv::StringRecord, ndates: usize) -> Result<WideRow> {
    if rec.len() != ndates + 4 {
        bail!("expected {} fields, got {}", ndates + 4, rec.len());
    }
    let lat: f64 = rec[2]
        .parse()
        .with_context(|| format!("bad latitude {:?}", &rec[2]))?;
    let long: f64 = rec[3]
        .parse()
        .with_context(|| format!("bad longitude {:?}", &rec[3]))?;
    let counts = rec
        .iter()
        .skip(4)
        .map(|cell| {
            // a blank cell means nothing was reported yet, not a parse fault
            if cell.is_empty() {
                Ok(0)
            } else {
                let v: f64 = cell
                    .parse()
                    .with_context(|| format!("bad count {:?}", cell))?;
                Ok(v as i64)
            }
        })
        .collect::<Result<Vec<i64>>>()?;
    Ok(WideRow {
        province: rec[0].to_string(),
        country: rec[1].to_string(),
        lat,
        long,
        counts,
    })
}

fn load_required(path: &Path) -> Result<WideTable> {
    load_wide(path)?.with_context(|| format!("no data loaded from {}", path.display()))
}

fn rename_country(country: &str) -> String {
    match country {
        "Mainland China" => "China".to_string(),
        "US" => "USA".to_string(),
        other => other.to_string(),
    }
}

fn index_rows(table: &WideTable) -> Result<HashMap<(&str, &str), &WideRow>> {
    let mut by_key = HashMap::new();
    for row in &table.rows {
        if by_key
            .insert((row.province.as_str(), row.country.as_str()), row)
            .is_some()
        {
            bail!("duplicate row for {:?} / {:?}", row.province, row.country);
        }
    }
    Ok(by_key)
}

/// Melt the three wide tables into one long table, joining deaths and
/// recovered onto the confirmed rows by (province, country). Any key or
/// date-column mismatch between the tables is an error rather than
/// silently misaligned output.
fn merge_long(
    confirmed: &WideTable,
    deaths: &WideTable,
    recovered: &WideTable,
) -> Result<Vec<CaseRecord>> {
    if deaths.dates != confirmed.dates || recovered.dates != confirmed.dates {
        bail!("date columns differ between the three time series");
    }
    index_rows(confirmed).context("confirmed time series")?;
    let deaths_by_key = index_rows(deaths).context("deaths time series")?;
    let recovered_by_key = index_rows(recovered).context("recovered time series")?;
    if deaths.rows.len() != confirmed.rows.len() || recovered.rows.len() != confirmed.rows.len() {
        bail!(
            "row counts differ: {} confirmed, {} deaths, {} recovered",
            confirmed.rows.len(),
            deaths.rows.len(),
            recovered.rows.len()
        );
    }

    let mut records = Vec::new();
    for (di, date) in confirmed.dates.iter().enumerate() {
        for row in &confirmed.rows {
            // county-level rows ("King County, WA") would double count the
            // state-level rows that carry the same cases
            if row.province.contains(',') {
                continue;
            }
            let key = (row.province.as_str(), row.country.as_str());
            let drow = deaths_by_key
                .get(&key)
                .with_context(|| format!("no deaths row for {:?} / {:?}", key.0, key.1))?;
            let rrow = recovered_by_key
                .get(&key)
                .with_context(|| format!("no recovered row for {:?} / {:?}", key.0, key.1))?;
            let confirmed_count = row.counts[di];
            let deaths_count = drow.counts[di];
            let recovered_count = rrow.counts[di];
            records.push(CaseRecord {
                province: row.province.clone(),
                country: rename_country(&row.country),
                lat: row.lat,
                long: row.long,
                date: *date,
                confirmed: confirmed_count,
                deaths: deaths_count,
                recovered: recovered_count,
                active: confirmed_count - deaths_count - recovered_count,
            });
        }
    }
    Ok(records)
}

fn write_cleaned(records: &[CaseRecord], path: &Path) -> Result<()> {
    let mut wtr =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for rec in records {
        wtr.serialize(rec)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Load the three wide tables, merge them into the long format, and write
/// the result as a single CSV at `out_path`.
fn clean_data(data_dir: &Path, out_path: &Path) -> Result<()> {
    let confirmed = load_required(&data_dir.join(CONFIRMED_CSV))?;
    let deaths = load_required(&data_dir.join(DEATHS_CSV))?;
    let recovered = load_required(&data_dir.join(RECOVERED_CSV))?;
    let records = merge_long(&confirmed, &deaths, &recovered)?;
    write_cleaned(&records, out_path)
}

fn csvrecs<T>(path: &Path) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
{
    let infile =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rdr = csv::Reader::from_reader(infile);
    rdr.deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("reading {}", path.display()))
}

fn latest_date(recs: &[CaseRecord]) -> Option<NaiveDate> {
    recs.iter().map(|r| r.date).max()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DayTotals {
    recovered: i64,
    deaths: i64,
    active: i64,
}

/// Sum recovered, deaths, and active counts across all regions, per date.
fn spread_by_date(recs: &[CaseRecord]) -> Vec<(NaiveDate, DayTotals)> {
    let mut by_date: BTreeMap<NaiveDate, DayTotals> = BTreeMap::new();
    for r in recs {
        let t = by_date.entry(r.date).or_default();
        t.recovered += r.recovered;
        t.deaths += r.deaths;
        t.active += r.active;
    }
    by_date.into_iter().collect()
}

#[derive(Debug, Clone, PartialEq)]
struct CountryTotals {
    country: String,
    confirmed: i64,
    deaths: i64,
    recovered: i64,
    active: i64,
    lat: f64,
    long: f64,
}

/// Aggregate the records of one date by country. The coordinates are the
/// mean of the country's rows and position its marker on the world map.
fn country_totals(recs: &[CaseRecord], date: NaiveDate) -> Vec<CountryTotals> {
    let by_country = recs
        .iter()
        .filter(|r| r.date == date)
        .map(|r| (r.country.clone(), r))
        .into_group_map();
    by_country
        .into_iter()
        .map(|(country, rows)| {
            let n = rows.len() as f64;
            CountryTotals {
                country,
                confirmed: rows.iter().map(|r| r.confirmed).sum(),
                deaths: rows.iter().map(|r| r.deaths).sum(),
                recovered: rows.iter().map(|r| r.recovered).sum(),
                active: rows.iter().map(|r| r.active).sum(),
                lat: rows.iter().map(|r| r.lat).sum::<f64>() / n,
                long: rows.iter().map(|r| r.long).sum::<f64>() / n,
            }
        })
        .sorted_by(|a, b| a.country.cmp(&b.country))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
struct ProvinceTotals {
    province: String,
    confirmed: i64,
    deaths: i64,
    recovered: i64,
    active: i64,
}

/// The top 20 Chinese provinces by confirmed count on `date`, returned in
/// ascending order of confirmed so the largest bar is drawn at the top.
fn china_top(recs: &[CaseRecord], date: NaiveDate) -> Vec<ProvinceTotals> {
    recs.iter()
        .filter(|r| r.date == date && r.country == "China")
        .map(|r| (r.province.clone(), r))
        .into_group_map()
        .into_iter()
        .map(|(province, rows)| ProvinceTotals {
            province,
            confirmed: rows.iter().map(|r| r.confirmed).sum(),
            deaths: rows.iter().map(|r| r.deaths).sum(),
            recovered: rows.iter().map(|r| r.recovered).sum(),
            active: rows.iter().map(|r| r.active).sum(),
        })
        .sorted_by_key(|p| Reverse(p.confirmed))
        .take(20)
        .sorted_by_key(|p| p.confirmed)
        .collect()
}

/// Stacked area chart of worldwide recovered/deaths/active counts over time.
fn plot_spread(recs: &[CaseRecord], out_dir: &Path) -> Result<()> {
    let totals = spread_by_date(recs);
    let (min_date, max_date) = match (totals.first(), totals.last()) {
        (Some((min, _)), Some((max, _))) => (*min, *max),
        _ => bail!("no observations to plot"),
    };
    let y_max = totals
        .iter()
        .map(|(_, t)| t.recovered + t.deaths + t.active)
        .max()
        .unwrap_or(1)
        .max(1);

    let img_path = out_dir.join(SPREAD_PNG);
    let root = BitMapBackend::new(&img_path, (1024, 768)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption("Number cases over time", ("sans-serif", 40))
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(min_date..max_date, 0i64..y_max)?;
    chart
        .configure_mesh()
        .x_labels(7)
        .x_desc("Date")
        .y_desc("Count")
        .draw()?;

    // Bands hold cumulative sums and are drawn largest first, so the
    // overdraw leaves each smaller band visible under the next one.
    chart
        .draw_series(AreaSeries::new(
            totals
                .iter()
                .map(|(d, t)| (*d, t.recovered + t.deaths + t.active)),
            0,
            &ACTIVE_YELLOW.mix(0.7),
        ))?
        .label("Active")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &ACTIVE_YELLOW));
    chart
        .draw_series(AreaSeries::new(
            totals.iter().map(|(d, t)| (*d, t.recovered + t.deaths)),
            0,
            &DEATHS_RED.mix(0.7),
        ))?
        .label("Deaths")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &DEATHS_RED));
    chart
        .draw_series(AreaSeries::new(
            totals.iter().map(|(d, t)| (*d, t.recovered)),
            0,
            &RECOVERED_GREEN.mix(0.7),
        ))?
        .label("Recovered")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RECOVERED_GREEN));

    chart
        .configure_series_labels()
        .border_style(&BLACK)
        .position(SeriesLabelPosition::UpperLeft)
        .draw()?;
    root.present()?;
    Ok(())
}

// Display clip range for the world map shading
const STATUS_RANGE: (i64, i64) = (1, 2500);

fn confirmed_shade(confirmed: i64) -> RGBColor {
    let clipped = confirmed.clamp(STATUS_RANGE.0, STATUS_RANGE.1);
    let t = (clipped - STATUS_RANGE.0) as f32 / (STATUS_RANGE.1 - STATUS_RANGE.0) as f32;
    // endpoints of the sequential "Blues" scale
    let low: LinSrgb<f32> = Srgb::new(0.87f32, 0.92, 0.97).into_linear();
    let high: LinSrgb<f32> = Srgb::new(0.03f32, 0.19, 0.42).into_linear();
    let shade: Srgb<f32> = Srgb::from_linear(low.mix(high, t));
    RGBColor(
        (shade.red * 255.0) as u8,
        (shade.green * 255.0) as u8,
        (shade.blue * 255.0) as u8,
    )
}

/// World map of the latest confirmed counts: one marker per country at its
/// mean coordinates, shaded by confirmed cases. No color legend is drawn.
fn plot_status(recs: &[CaseRecord], out_dir: &Path) -> Result<()> {
    let latest = latest_date(recs).context("no observations to plot")?;
    let countries = country_totals(recs, latest);

    let img_path = out_dir.join(STATUS_PNG);
    let root = BitMapBackend::new(&img_path, (1024, 768)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption("Countries with Confirmed Cases", ("sans-serif", 40))
        .set_label_area_size(LabelAreaPosition::Left, 50)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(-180.0f64..180.0, -90.0f64..90.0)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("Longitude")
        .y_desc("Latitude")
        .draw()?;
    chart.draw_series(
        countries
            .iter()
            .map(|c| Circle::new((c.long, c.lat), 6, confirmed_shade(c.confirmed).filled())),
    )?;
    root.present()?;
    Ok(())
}

fn draw_china_bars(provinces: &[ProvinceTotals], spec: &BarSpec, img_path: &Path) -> Result<()> {
    let x_max = provinces
        .iter()
        .map(|p| spec.metric.of(p))
        .max()
        .unwrap_or(0)
        + spec.headroom;
    let names: Vec<String> = provinces.iter().map(|p| p.province.clone()).collect();

    let root = BitMapBackend::new(img_path, (700, 700)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .caption(spec.title, ("sans-serif", 30))
        .set_label_area_size(LabelAreaPosition::Left, 110)
        .set_label_area_size(LabelAreaPosition::Bottom, 40)
        .build_cartesian_2d(0i64..x_max, (0..provinces.len()).into_segmented())?;
    chart
        .configure_mesh()
        .disable_y_mesh()
        .y_labels(provinces.len() + 1)
        .y_label_formatter(&|pos| match pos {
            SegmentValue::Exact(i) | SegmentValue::CenterOf(i) => {
                names.get(*i).cloned().unwrap_or_default()
            }
            SegmentValue::Last => String::new(),
        })
        .x_desc(spec.metric.label())
        .draw()?;

    chart.draw_series(
        Histogram::horizontal(&chart)
            .style(spec.metric.color().filled())
            .margin(4)
            .data(
                provinces
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (i, spec.metric.of(p))),
            ),
    )?;

    // value labels just past the end of each bar
    let label_font = ("sans-serif", 14).into_font();
    chart.draw_series(provinces.iter().enumerate().map(|(i, p)| {
        let v = spec.metric.of(p);
        Text::new(
            v.to_string(),
            (v + spec.headroom / 50, SegmentValue::CenterOf(i)),
            label_font.clone(),
        )
    }))?;
    root.present()?;
    Ok(())
}

/// Four horizontal bar charts over the same top-20 province set, one per
/// metric, each with its own color and axis headroom.
fn plot_china(recs: &[CaseRecord], out_dir: &Path) -> Result<()> {
    let latest = latest_date(recs).context("no observations to plot")?;
    let provinces = china_top(recs, latest);
    for spec in &CHINA_BARS {
        draw_china_bars(&provinces, spec, &out_dir.join(spec.file))?;
    }
    Ok(())
}

fn print_latest_totals(countries: &[CountryTotals], latest: NaiveDate) {
    let confirmed: i64 = countries.iter().map(|c| c.confirmed).sum();
    let deaths: i64 = countries.iter().map(|c| c.deaths).sum();
    let recovered: i64 = countries.iter().map(|c| c.recovered).sum();
    let active: i64 = countries.iter().map(|c| c.active).sum();
    println!(
        "As of {}: {} confirmed, {} deaths, {} recovered, {} active in {} countries.",
        latest,
        confirmed,
        deaths,
        recovered,
        active,
        countries.len()
    );
    if let Some(worst) = countries.iter().max_by_key(|c| c.confirmed) {
        println!(
            "Hardest hit: {} with {} confirmed.",
            worst.country, worst.confirmed
        );
    }
}

fn run(opt: &Opt) -> Result<()> {
    std::fs::create_dir_all(&opt.out_dir)
        .with_context(|| format!("creating {}", opt.out_dir.display()))?;
    let cleaned_path = opt.out_dir.join(CLEANED_CSV);
    clean_data(&opt.data_dir, &cleaned_path)?;

    let records: Vec<CaseRecord> = csvrecs(&cleaned_path)?;
    let latest = latest_date(&records).context("cleaned table has no rows")?;
    print_latest_totals(&country_totals(&records, latest), latest);

    plot_spread(&records, &opt.out_dir)?;
    plot_status(&records, &opt.out_dir)?;
    plot_china(&records, &opt.out_dir)?;
    Ok(())
}

fn main() {
    let opt = Opt::from_args();
    if let Err(e) = run(&opt) {
        println!("Error generating report: {:?}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn wide_row(province: &str, country: &str, counts: &[i64]) -> WideRow {
        WideRow {
            province: province.to_string(),
            country: country.to_string(),
            lat: 0.0,
            long: 0.0,
            counts: counts.to_vec(),
        }
    }

    fn rec(province: &str, country: &str, date: NaiveDate, c: i64, dth: i64, r: i64) -> CaseRecord {
        CaseRecord {
            province: province.to_string(),
            country: country.to_string(),
            lat: 0.0,
            long: 0.0,
            date,
            confirmed: c,
            deaths: dth,
            recovered: r,
            active: c - dth - r,
        }
    }

    fn write_wide(
        dir: &Path,
        name: &str,
        dates: &[&str],
        rows: &[(&str, &str, f64, f64, Vec<&str>)],
    ) -> PathBuf {
        let path = dir.join(name);
        let mut wtr = csv::Writer::from_path(&path).unwrap();
        let mut header = vec![
            "Province/State".to_string(),
            "Country/Region".to_string(),
            "Lat".to_string(),
            "Long".to_string(),
        ];
        header.extend(dates.iter().map(|s| s.to_string()));
        wtr.write_record(&header).unwrap();
        for (province, country, lat, long, counts) in rows {
            let mut fields = vec![
                province.to_string(),
                country.to_string(),
                lat.to_string(),
                long.to_string(),
            ];
            fields.extend(counts.iter().map(|s| s.to_string()));
            wtr.write_record(&fields).unwrap();
        }
        wtr.flush().unwrap();
        path
    }

    #[test]
    fn missing_file_yields_absent_result() {
        let tmp = TempDir::new().unwrap();
        let loaded = load_wide(&tmp.path().join("nope.csv")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn loader_parses_dates_and_fills_blank_counts() {
        let tmp = TempDir::new().unwrap();
        let path = write_wide(
            tmp.path(),
            "confirmed.csv",
            &["1/22/20", "1/23/20"],
            &[("", "Japan", 36.0, 138.0, vec!["1", ""])],
        );
        let table = load_wide(&path).unwrap().unwrap();
        assert_eq!(table.dates, vec![d(2020, 1, 22), d(2020, 1, 23)]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].province, "");
        assert_eq!(table.rows[0].counts, vec![1, 0]);
    }

    #[test]
    fn loader_rejects_non_numeric_counts() {
        let tmp = TempDir::new().unwrap();
        let path = write_wide(
            tmp.path(),
            "confirmed.csv",
            &["1/22/20"],
            &[("", "Japan", 36.0, 138.0, vec!["many"])],
        );
        assert!(load_wide(&path).is_err());
    }

    fn sample_tables() -> (WideTable, WideTable, WideTable) {
        let dates = vec![d(2020, 1, 22), d(2020, 1, 23)];
        let confirmed = WideTable {
            dates: dates.clone(),
            rows: vec![
                wide_row("Hubei", "Mainland China", &[100, 150]),
                wide_row("King County, WA", "US", &[5, 10]),
                wide_row("", "US", &[20, 30]),
            ],
        };
        let deaths = WideTable {
            dates: dates.clone(),
            rows: vec![
                wide_row("Hubei", "Mainland China", &[10, 20]),
                wide_row("King County, WA", "US", &[0, 1]),
                wide_row("", "US", &[1, 2]),
            ],
        };
        let recovered = WideTable {
            dates,
            rows: vec![
                wide_row("Hubei", "Mainland China", &[30, 40]),
                wide_row("King County, WA", "US", &[0, 0]),
                wide_row("", "US", &[2, 3]),
            ],
        };
        (confirmed, deaths, recovered)
    }

    #[test]
    fn merge_drops_counties_renames_countries_and_derives_active() {
        let (confirmed, deaths, recovered) = sample_tables();
        let records = merge_long(&confirmed, &deaths, &recovered).unwrap();

        // 2 non-county rows x 2 dates
        assert_eq!(records.len(), 4);
        for r in &records {
            assert!(!r.province.contains(','));
            assert_ne!(r.country, "Mainland China");
            assert_ne!(r.country, "US");
            assert_eq!(r.active, r.confirmed - r.deaths - r.recovered);
        }
        assert!(records.iter().any(|r| r.country == "China"));
        assert!(records.iter().any(|r| r.country == "USA"));

        // date-major ordering, confirmed row order within a date
        assert_eq!(records[0].province, "Hubei");
        assert_eq!(records[0].date, d(2020, 1, 22));
        assert_eq!(records[0].active, 100 - 10 - 30);
        assert_eq!(records[2].date, d(2020, 1, 23));
    }

    #[test]
    fn merge_rejects_missing_row_key() {
        let (confirmed, mut deaths, recovered) = sample_tables();
        deaths.rows[0].province = "Beijing".to_string();
        let err = merge_long(&confirmed, &deaths, &recovered).unwrap_err();
        assert!(format!("{:?}", err).contains("no deaths row"));
    }

    #[test]
    fn merge_rejects_differing_date_columns() {
        let (confirmed, mut deaths, recovered) = sample_tables();
        deaths.dates[1] = d(2020, 1, 24);
        assert!(merge_long(&confirmed, &deaths, &recovered).is_err());
    }

    #[test]
    fn merge_rejects_duplicate_rows() {
        let (mut confirmed, deaths, recovered) = sample_tables();
        confirmed
            .rows
            .push(wide_row("Hubei", "Mainland China", &[1, 1]));
        assert!(merge_long(&confirmed, &deaths, &recovered).is_err());
    }

    #[test]
    fn cleaned_csv_round_trips() {
        let tmp = TempDir::new().unwrap();
        let (confirmed, deaths, recovered) = sample_tables();
        let records = merge_long(&confirmed, &deaths, &recovered).unwrap();
        let path = tmp.path().join(CLEANED_CSV);
        write_cleaned(&records, &path).unwrap();
        let reloaded: Vec<CaseRecord> = csvrecs(&path).unwrap();
        assert_eq!(reloaded, records);
    }

    #[test]
    fn end_to_end_clean_reload_and_aggregate() {
        let tmp = TempDir::new().unwrap();
        fn rows<'a>(a: &'a str, b: &'a str) -> Vec<(&'a str, &'a str, f64, f64, Vec<&'a str>)> {
            vec![
                ("Region A", "Elbonia", 1.0, 2.0, vec![a]),
                ("Region B", "Elbonia", 3.0, 4.0, vec![b]),
            ]
        }
        write_wide(tmp.path(), CONFIRMED_CSV, &["1/22/20"], &rows("10", "20"));
        write_wide(tmp.path(), DEATHS_CSV, &["1/22/20"], &rows("0", "0"));
        write_wide(tmp.path(), RECOVERED_CSV, &["1/22/20"], &rows("0", "0"));

        let cleaned = tmp.path().join(CLEANED_CSV);
        clean_data(tmp.path(), &cleaned).unwrap();
        let records: Vec<CaseRecord> = csvrecs(&cleaned).unwrap();

        assert_eq!(records.len(), 2);
        for r in &records {
            assert_eq!(r.date, d(2020, 1, 22));
            assert_eq!(r.active, r.confirmed);
        }
        let totals = spread_by_date(&records);
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].1.active, 30);
        assert_eq!(totals[0].1.deaths, 0);
    }

    #[test]
    fn clean_data_reports_missing_input() {
        let tmp = TempDir::new().unwrap();
        let err = clean_data(tmp.path(), &tmp.path().join(CLEANED_CSV)).unwrap_err();
        assert!(format!("{:?}", err).contains(CONFIRMED_CSV));
    }

    #[test]
    fn country_totals_sums_metrics_and_averages_coordinates() {
        let date = d(2020, 2, 1);
        let mut a = rec("North", "Italy", date, 10, 1, 2);
        a.lat = 10.0;
        let mut b = rec("South", "Italy", date, 30, 3, 4);
        b.lat = 20.0;
        let stale = rec("North", "Italy", d(2020, 1, 31), 99, 0, 0);
        let countries = country_totals(&[a, b, stale], date);

        assert_eq!(countries.len(), 1);
        assert_eq!(countries[0].country, "Italy");
        assert_eq!(countries[0].confirmed, 40);
        assert_eq!(countries[0].deaths, 4);
        assert_eq!(countries[0].recovered, 6);
        assert_eq!(countries[0].active, 40 - 4 - 6);
        assert!((countries[0].lat - 15.0).abs() < 1e-9);
    }

    #[test]
    fn china_top_keeps_top_twenty_ascending() {
        let date = d(2020, 2, 1);
        let mut recs: Vec<CaseRecord> = (1i64..=25)
            .map(|i| rec(&format!("P{:02}", i), "China", date, i * 10, 0, 0))
            .collect();
        // rows that must not affect the selection
        recs.push(rec("P01", "China", d(2020, 1, 31), 99_999, 0, 0));
        recs.push(rec("Lombardy", "Italy", date, 99_999, 0, 0));

        let top = china_top(&recs, date);
        assert_eq!(top.len(), 20);
        assert_eq!(top[0].confirmed, 60);
        assert_eq!(top[19].confirmed, 250);
        assert!(top.windows(2).all(|w| w[0].confirmed <= w[1].confirmed));
    }

    #[test]
    fn status_shade_clips_to_display_range() {
        fn bytes(confirmed: i64) -> (u8, u8, u8) {
            let shade = confirmed_shade(confirmed);
            (shade.0, shade.1, shade.2)
        }
        assert_eq!(bytes(0), bytes(1));
        assert_eq!(bytes(2500), bytes(1_000_000));
        assert_ne!(bytes(1), bytes(2500));
    }
}
