use crate::error::RetentionError;
use chrono::{DateTime, SecondsFormat, SubsecRound, TimeZone, Utc};

/// 统一存储为 RFC3339 / ISO-8601（UTC, `Z`），毫秒精度
pub fn to_utc_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 当前 UTC 时间，截断到毫秒，与存储精度一致
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// 解析时间字符串为 UTC：
/// - 优先 RFC3339 / ISO-8601（带时区偏移或 `Z`）
/// - 兼容 Postgres 常见字符串格式：`YYYY-MM-DD HH:mm:ss(.f)?(+/-offset)`
pub fn parse_utc_string(s: &str) -> crate::error::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    fn normalize_trailing_offset(raw: &str) -> Option<String> {
        let pos = raw.rfind(|c| c == '+' || c == '-')?;
        let (prefix, offset) = raw.split_at(pos);
        if offset.contains(':') {
            return None;
        }
        match offset.len() {
            // +HH / -HH
            3 => Some(format!("{prefix}{offset}:00")),
            // +HHMM / -HHMM
            5 => Some(format!("{prefix}{}:{}", &offset[..3], &offset[3..])),
            _ => None,
        }
    }

    // Some deployments might have stored timestamps like "YYYY-MM-DD HH:mm:ss UTC".
    if let Some(stripped) = s.strip_suffix(" UTC") {
        use chrono::NaiveDateTime;
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y-%m-%d %H:%M:%S")
            .map_err(|e| RetentionError::TimeParse(e.to_string()))?;
        return Ok(Utc.from_utc_datetime(&naive));
    }

    // Postgres can surface "YYYY-MM-DD HH:mm:ss+00" / "+0000" / "+00:00" (optionally with .f)
    // depending on column type / legacy values.
    let candidates = [Some(s.to_string()), normalize_trailing_offset(s)];
    for cand in candidates.into_iter().flatten() {
        for fmt in [
            "%Y-%m-%d %H:%M:%S%:z",
            "%Y-%m-%d %H:%M:%S%.f%:z",
            "%Y-%m-%d %H:%M:%S%z",
            "%Y-%m-%d %H:%M:%S%.f%z",
        ] {
            if let Ok(dt) = DateTime::parse_from_str(&cand, fmt) {
                return Ok(dt.with_timezone(&Utc));
            }
        }
    }

    Err(RetentionError::TimeParse(format!(
        "Unrecognized datetime string: {}",
        s
    )))
}

// tracing_subscriber 自定义时间格式：输出 UTC，与数据库一致
pub struct UtcTimer;

impl tracing_subscriber::fmt::time::FormatTime for UtcTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Utc::now();
        let s = to_utc_string(&now);
        write!(w, "{}", s)
    }
}
