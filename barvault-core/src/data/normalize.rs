//! Provider row normalization onto the fixed bar schema.
//!
//! Providers disagree on field names (`日期` vs `date` vs `trade_date`) and
//! on date formats. Rows are mapped through an alias table, the symbol is
//! forced to the canonical code, and the result is sorted and deduplicated.

use chrono::NaiveDate;

use super::provider::{DataError, ProviderRow};
use crate::bar::{dedup_keep_last, Bar};
use crate::symbol::Symbol;

const DATE: &[&str] = &["date", "日期", "trade_date", "datetime", "timestamp"];
const OPEN: &[&str] = &["open", "开盘"];
const HIGH: &[&str] = &["high", "最高"];
const LOW: &[&str] = &["low", "最低"];
const CLOSE: &[&str] = &["close", "收盘"];
const VOLUME: &[&str] = &["volume", "成交量", "vol"];
const AMOUNT: &[&str] = &["amount", "成交额", "turnover"];
const CHANGE_PERCENT: &[&str] = &["change_percent", "涨跌幅", "pct_chg"];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"];

/// Map provider rows onto [`Bar`]s for `symbol`.
///
/// A row missing one of the required fields fails the whole response: a
/// schema change is not something to paper over row by row.
pub fn normalize_rows(symbol: &Symbol, rows: Vec<ProviderRow>) -> Result<Vec<Bar>, DataError> {
    let context = format!("provider rows for {symbol}");
    let mut bars = Vec::with_capacity(rows.len());

    for row in &rows {
        let date_text = required(row, DATE, "date", &context)?;
        let date = parse_date(date_text).ok_or_else(|| {
            DataError::ResponseFormatChanged(format!("unparseable date '{date_text}' in {context}"))
        })?;

        bars.push(Bar {
            date,
            symbol: symbol.code().to_string(),
            open: price(row, OPEN, "open", &context)?,
            high: price(row, HIGH, "high", &context)?,
            low: price(row, LOW, "low", &context)?,
            close: price(row, CLOSE, "close", &context)?,
            volume: parse_number(required(row, VOLUME, "volume", &context)?, &context)?
                .unwrap_or(0.0),
            amount: optional(row, AMOUNT, &context)?,
            change_percent: optional(row, CHANGE_PERCENT, &context)?,
        });
    }

    Ok(dedup_keep_last(bars))
}

/// Parse the date formats seen across providers. A time suffix is ignored.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let day = text
        .split(|c: char| c == 'T' || c == ' ')
        .next()
        .unwrap_or(text);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(day, fmt).ok())
}

fn lookup<'r>(row: &'r ProviderRow, aliases: &[&str]) -> Option<&'r str> {
    aliases.iter().find_map(|alias| {
        row.get(alias).or_else(|| {
            row.keys()
                .find(|k| k.eq_ignore_ascii_case(alias))
                .and_then(|k| row.get(k))
        })
    })
}

fn required<'r>(
    row: &'r ProviderRow,
    aliases: &[&str],
    column: &str,
    context: &str,
) -> Result<&'r str, DataError> {
    lookup(row, aliases).ok_or_else(|| DataError::MissingColumn {
        column: column.to_string(),
        context: context.to_string(),
    })
}

fn price(
    row: &ProviderRow,
    aliases: &[&str],
    column: &str,
    context: &str,
) -> Result<f64, DataError> {
    Ok(parse_number(required(row, aliases, column, context)?, context)?.unwrap_or(f64::NAN))
}

fn optional(row: &ProviderRow, aliases: &[&str], context: &str) -> Result<Option<f64>, DataError> {
    match lookup(row, aliases) {
        Some(text) => parse_number(text, context),
        None => Ok(None),
    }
}

/// Empty cells are `None`; anything else must parse.
fn parse_number(text: &str, context: &str) -> Result<Option<f64>, DataError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.replace(',', "")
        .parse::<f64>()
        .map(Some)
        .map_err(|_| DataError::ResponseFormatChanged(format!("unparseable number '{text}' in {context}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(date: &str) -> ProviderRow {
        ProviderRow::new()
            .with("date", date)
            .with("open", "10")
            .with("high", "11")
            .with("low", "9")
            .with("close", "10.5")
            .with("volume", "1000")
    }

    #[test]
    fn forces_canonical_symbol() {
        let sym = Symbol::stock("000001");
        let bars = normalize_rows(&sym, vec![row("2024-01-02").with("symbol", "1")]).unwrap();
        assert_eq!(bars[0].symbol, "000001");
        assert_eq!(bars[0].close, 10.5);
    }

    #[test]
    fn maps_native_field_names() {
        let sym = Symbol::stock("600000");
        let native = ProviderRow::new()
            .with("日期", "20240103")
            .with("开盘", "7.1")
            .with("最高", "7.3")
            .with("最低", "7.0")
            .with("收盘", "7.2")
            .with("成交量", "1,234")
            .with("涨跌幅", "0.5");
        let bars = normalize_rows(&sym, vec![native]).unwrap();
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(bars[0].volume, 1234.0);
        assert_eq!(bars[0].change_percent, Some(0.5));
        assert_eq!(bars[0].amount, None);
    }

    #[test]
    fn sorts_and_dedups_provider_output() {
        let sym = Symbol::stock("000001");
        let mut late = row("2024-01-02");
        late.insert("close", "12");
        let bars = normalize_rows(
            &sym,
            vec![row("2024-01-03"), row("2024-01-02"), late],
        )
        .unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 12.0);
    }

    #[test]
    fn missing_required_column_is_structural_error() {
        let sym = Symbol::stock("000001");
        let broken = ProviderRow::new().with("date", "2024-01-02").with("close", "1");
        assert!(matches!(
            normalize_rows(&sym, vec![broken]),
            Err(DataError::MissingColumn { .. })
        ));
    }

    #[test]
    fn parses_date_variants() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5);
        assert_eq!(parse_date("2024-03-05"), expected);
        assert_eq!(parse_date("20240305"), expected);
        assert_eq!(parse_date("2024/03/05"), expected);
        assert_eq!(parse_date("2024-03-05 00:00:00"), expected);
        assert_eq!(parse_date("2024-03-05T15:00:00"), expected);
        assert_eq!(parse_date("March 5"), None);
    }

    #[test]
    fn header_lookup_ignores_ascii_case() {
        let sym = Symbol::stock("000001");
        let upper = ProviderRow::new()
            .with("Date", "2024-01-02")
            .with("Open", "1")
            .with("High", "1")
            .with("Low", "1")
            .with("Close", "1")
            .with("Volume", "");
        let bars = normalize_rows(&sym, vec![upper]).unwrap();
        assert_eq!(bars[0].volume, 0.0);
    }
}
