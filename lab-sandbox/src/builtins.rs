//! Standard capability implementations.

use std::fs;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use lab_primitives::{AggFunc, Aggregate, CompareOp, ErrorKind, Predicate, Schema, Table, Value};
use lab_registry::DatasetHandle;

use crate::capability::CapabilitySpec;
use crate::context::CallContext;
use crate::script::{ScriptError, ScriptResult, ScriptValue};

/// Every capability the standard table offers.
pub(crate) static STANDARD: &[CapabilitySpec] = &[
    CapabilitySpec::new("print", "write values to the captured output", false, print),
    CapabilitySpec::new("dataset", "look up a dataset in scope by name", false, dataset),
    CapabilitySpec::new("scan", "read rows with optional projection and limit", false, scan),
    CapabilitySpec::new("collect", "materialize a dataset as a table", false, collect),
    CapabilitySpec::new("filter", "keep rows where `column op value`", false, filter),
    CapabilitySpec::new("select", "project columns", false, select),
    CapabilitySpec::new("head", "first n rows", false, head),
    CapabilitySpec::new("sort", "sort rows by a column", false, sort),
    CapabilitySpec::new("aggregate", "grouped aggregation", false, aggregate),
    CapabilitySpec::new("count", "number of rows", false, count),
    CapabilitySpec::new("columns", "column names", false, columns),
    CapabilitySpec::new("describe", "schema and row count summary", false, describe),
    CapabilitySpec::new("sum", "sum of a column or list", false, sum),
    CapabilitySpec::new("mean", "mean of a column or list", false, mean),
    CapabilitySpec::new("min", "minimum of a column or list", false, min),
    CapabilitySpec::new("max", "maximum of a column or list", false, max),
    CapabilitySpec::new("len", "length of text, a list, or a table", false, len),
    CapabilitySpec::new("str", "text form of a value", false, str_),
    CapabilitySpec::new("repeat", "repeat text n times", false, repeat),
    CapabilitySpec::new("sleep", "pause for a number of seconds", false, sleep),
    CapabilitySpec::new("artifact", "attach content to the result", false, artifact),
    CapabilitySpec::new("fail", "raise an execution error", false, fail),
    CapabilitySpec::new("read_text", "read a text file", true, read_text),
    CapabilitySpec::new("write_text", "write a text file", true, write_text),
    CapabilitySpec::new("write_csv", "write a table as CSV", true, write_csv),
    CapabilitySpec::new("list_dir", "list directory entries", true, list_dir),
];

fn arity(name: &str, args: &[ScriptValue], min: usize, max: usize) -> ScriptResult<()> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        min.to_string()
    } else {
        format!("{min} to {max}")
    };
    Err(ScriptError::execution(format!(
        "{name}() takes {expected} arguments, got {}",
        args.len()
    )))
}

fn type_error(name: &str, what: &str, found: &ScriptValue) -> ScriptError {
    ScriptError::execution(format!(
        "{name}() expects {what}, found {}",
        found.type_name()
    ))
}

fn text_arg<'v>(name: &str, value: &'v ScriptValue) -> ScriptResult<&'v str> {
    match value {
        ScriptValue::Text(text) => Ok(text),
        other => Err(type_error(name, "text", other)),
    }
}

fn int_arg(name: &str, value: &ScriptValue) -> ScriptResult<i64> {
    match value {
        ScriptValue::Int(v) => Ok(*v),
        other => Err(type_error(name, "an integer", other)),
    }
}

fn count_arg(name: &str, value: &ScriptValue) -> ScriptResult<usize> {
    usize::try_from(int_arg(name, value)?)
        .map_err(|_| ScriptError::execution(format!("{name}() expects a non-negative count")))
}

fn text_list(name: &str, value: &ScriptValue) -> ScriptResult<Vec<String>> {
    match value {
        ScriptValue::Text(text) => Ok(vec![text.clone()]),
        ScriptValue::List(items) => items
            .iter()
            .map(|item| text_arg(name, item).map(str::to_owned))
            .collect(),
        other => Err(type_error(name, "a list of column names", other)),
    }
}

/// Either tabular value a capability may receive.
enum Tabular<'v> {
    Table(&'v Arc<Table>),
    Dataset(&'v DatasetHandle),
}

impl Tabular<'_> {
    fn schema(&self) -> &Schema {
        match self {
            Self::Table(table) => table.schema(),
            Self::Dataset(handle) => handle.schema(),
        }
    }

    fn row_count(&self) -> u64 {
        match self {
            Self::Table(table) => table.row_count() as u64,
            Self::Dataset(handle) => handle.row_count(),
        }
    }

    fn collect(&self) -> ScriptResult<Arc<Table>> {
        match self {
            Self::Table(table) => Ok(Arc::clone(table)),
            Self::Dataset(handle) => Ok(Arc::new(handle.collect()?)),
        }
    }

    fn aggregate(&self, group_by: &[String], aggs: &[Aggregate]) -> ScriptResult<Table> {
        match self {
            Self::Table(table) => Ok(table.aggregate(group_by, aggs)?),
            Self::Dataset(handle) => Ok(handle.aggregate(group_by, aggs)?),
        }
    }
}

fn tabular<'v>(name: &str, value: &'v ScriptValue) -> ScriptResult<Tabular<'v>> {
    match value {
        ScriptValue::Table(table) => Ok(Tabular::Table(table)),
        ScriptValue::Dataset(handle) => Ok(Tabular::Dataset(handle)),
        other => Err(type_error(name, "a table or dataset", other)),
    }
}

fn print(ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    let line = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    ctx.print(&line);
    Ok(ScriptValue::Null)
}

fn dataset(ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("dataset", &args, 1, 1)?;
    let name = text_arg("dataset", &args[0])?;
    if ctx.scope().is_denied(name) {
        return Err(ScriptError::access_denied(format!("`{name}` is denied by policy")));
    }
    ctx.scope()
        .dataset(name)
        .map(|handle| ScriptValue::Dataset(Arc::clone(handle)))
        .ok_or_else(|| {
            ScriptError::new(
                ErrorKind::NotFound,
                format!("dataset `{name}` is not in this execution's scope"),
            )
        })
}

fn scan(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("scan", &args, 1, 3)?;
    let projection = match args.get(1) {
        None | Some(ScriptValue::Null) => None,
        Some(value) => Some(text_list("scan", value)?),
    };
    let limit = match args.get(2) {
        None | Some(ScriptValue::Null) => None,
        Some(value) => Some(count_arg("scan", value)?),
    };
    let table = match tabular("scan", &args[0])? {
        Tabular::Dataset(handle) => handle.scan(projection.as_deref(), limit)?,
        Tabular::Table(table) => {
            let projected = match &projection {
                Some(columns) => table.select(columns)?,
                None => (**table).clone(),
            };
            match limit {
                Some(n) => projected.head(n),
                None => projected,
            }
        }
    };
    Ok(table.into())
}

fn collect(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("collect", &args, 1, 1)?;
    Ok(ScriptValue::Table(tabular("collect", &args[0])?.collect()?))
}

fn filter(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("filter", &args, 4, 4)?;
    let column = text_arg("filter", &args[1])?;
    let op = CompareOp::from_str(text_arg("filter", &args[2])?)?;
    let predicate = Predicate::new(column, op, args[3].to_cell()?);
    let table = match tabular("filter", &args[0])? {
        Tabular::Dataset(handle) => handle.filter(std::slice::from_ref(&predicate), None)?,
        Tabular::Table(table) => table.filter(std::slice::from_ref(&predicate))?,
    };
    Ok(table.into())
}

fn select(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("select", &args, 2, 2)?;
    let columns = text_list("select", &args[1])?;
    let table = match tabular("select", &args[0])? {
        Tabular::Dataset(handle) => handle.scan(Some(&columns), None)?,
        Tabular::Table(table) => table.select(&columns)?,
    };
    Ok(table.into())
}

fn head(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("head", &args, 1, 2)?;
    let n = match args.get(1) {
        Some(value) => count_arg("head", value)?,
        None => 5,
    };
    let table = match tabular("head", &args[0])? {
        Tabular::Dataset(handle) => handle.scan(None, Some(n))?,
        Tabular::Table(table) => table.head(n),
    };
    Ok(table.into())
}

fn sort(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("sort", &args, 2, 3)?;
    let column = text_arg("sort", &args[1])?;
    let descending = args.get(2).is_some_and(ScriptValue::is_truthy);
    let table = tabular("sort", &args[0])?.collect()?;
    Ok(table.sort_by(column, descending)?.into())
}

/// Parses `"func"` or `"func:column"`.
fn parse_aggregate(spec: &str) -> ScriptResult<Aggregate> {
    let (func, column) = match spec.split_once(':') {
        Some((func, column)) => (func, Some(column.trim().to_owned())),
        None => (spec, None),
    };
    let func = AggFunc::from_str(func.trim())?;
    if column.is_none() && func != AggFunc::Count {
        return Err(ScriptError::execution(format!(
            "aggregate `{spec}` needs a column, e.g. \"{func}:amount\""
        )));
    }
    Ok(Aggregate::new(func, column))
}

fn aggregate(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("aggregate", &args, 3, 3)?;
    let group_by = match &args[1] {
        ScriptValue::Null => Vec::new(),
        other => text_list("aggregate", other)?,
    };
    let aggs = text_list("aggregate", &args[2])?
        .iter()
        .map(|spec| parse_aggregate(spec))
        .collect::<ScriptResult<Vec<_>>>()?;
    Ok(tabular("aggregate", &args[0])?
        .aggregate(&group_by, &aggs)?
        .into())
}

fn count(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("count", &args, 1, 1)?;
    let rows = tabular("count", &args[0])?.row_count();
    i64::try_from(rows)
        .map(ScriptValue::Int)
        .map_err(|_| ScriptError::execution("row count out of range"))
}

fn columns(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("columns", &args, 1, 1)?;
    let names = tabular("columns", &args[0])?.schema().names();
    Ok(ScriptValue::List(
        names.into_iter().map(ScriptValue::Text).collect(),
    ))
}

fn describe(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("describe", &args, 1, 1)?;
    let source = tabular("describe", &args[0])?;
    let fields = source
        .schema()
        .fields()
        .iter()
        .map(|field| format!("{}:{}", field.name(), field.ty()))
        .collect::<Vec<_>>()
        .join(", ");
    let label = match &source {
        Tabular::Dataset(handle) => format!("dataset {} ({})", handle.name(), handle.backend()),
        Tabular::Table(_) => "table".to_owned(),
    };
    Ok(ScriptValue::Text(format!(
        "{label}: {} rows, columns [{fields}]",
        source.row_count()
    )))
}

fn column_stat(name: &str, func: AggFunc, args: &[ScriptValue]) -> ScriptResult<ScriptValue> {
    if let Some(ScriptValue::List(items)) = args.first() {
        arity(name, args, 1, 1)?;
        return list_stat(name, func, items);
    }
    arity(name, args, 2, 2)?;
    let column = text_arg(name, &args[1])?.to_owned();
    let result =
        tabular(name, &args[0])?.aggregate(&[], &[Aggregate::new(func, Some(column))])?;
    Ok(result
        .rows()
        .first()
        .and_then(|row| row.first())
        .cloned()
        .map_or(ScriptValue::Null, ScriptValue::from))
}

fn list_stat(name: &str, func: AggFunc, items: &[ScriptValue]) -> ScriptResult<ScriptValue> {
    match func {
        AggFunc::Min | AggFunc::Max => {
            let mut best: Option<&ScriptValue> = None;
            for item in items.iter().filter(|item| !matches!(item, ScriptValue::Null)) {
                best = match best {
                    None => Some(item),
                    Some(current) => {
                        let ordering = item.compare(current)?;
                        let better = if func == AggFunc::Min {
                            ordering.is_lt()
                        } else {
                            ordering.is_gt()
                        };
                        Some(if better { item } else { current })
                    }
                };
            }
            Ok(best.cloned().unwrap_or_default())
        }
        AggFunc::Sum | AggFunc::Mean => {
            let mut int_total: Option<i64> = Some(0);
            let mut float_total = 0.0;
            let mut n = 0usize;
            for item in items.iter().filter(|item| !matches!(item, ScriptValue::Null)) {
                let value = item
                    .as_f64()
                    .ok_or_else(|| type_error(name, "numbers", item))?;
                int_total = match item {
                    ScriptValue::Int(v) => int_total.and_then(|total| total.checked_add(*v)),
                    _ => None,
                };
                float_total += value;
                n += 1;
            }
            if func == AggFunc::Mean {
                #[allow(clippy::cast_precision_loss)]
                let mean = (n > 0).then(|| float_total / n as f64);
                return Ok(mean.map_or(ScriptValue::Null, ScriptValue::Float));
            }
            Ok(int_total.map_or(ScriptValue::Float(float_total), ScriptValue::Int))
        }
        AggFunc::Count => Ok(ScriptValue::Int(
            i64::try_from(items.len()).unwrap_or(i64::MAX),
        )),
    }
}

fn sum(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    column_stat("sum", AggFunc::Sum, &args)
}

fn mean(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    column_stat("mean", AggFunc::Mean, &args)
}

fn min(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    column_stat("min", AggFunc::Min, &args)
}

fn max(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    column_stat("max", AggFunc::Max, &args)
}

fn len(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("len", &args, 1, 1)?;
    let n = match &args[0] {
        ScriptValue::Text(text) => text.chars().count() as u64,
        ScriptValue::List(items) => items.len() as u64,
        ScriptValue::Table(table) => table.row_count() as u64,
        ScriptValue::Dataset(handle) => handle.row_count(),
        other => return Err(type_error("len", "text, a list, or a table", other)),
    };
    i64::try_from(n)
        .map(ScriptValue::Int)
        .map_err(|_| ScriptError::execution("length out of range"))
}

fn str_(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("str", &args, 1, 1)?;
    Ok(ScriptValue::Text(args[0].to_string()))
}

fn repeat(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("repeat", &args, 2, 2)?;
    let text = text_arg("repeat", &args[0])?;
    let times = count_arg("repeat", &args[1])?;
    let bytes = text.len().checked_mul(times).ok_or_else(|| {
        ScriptError::resource_exceeded("repeat() result size overflows")
    })?;
    let mut out = String::new();
    out.try_reserve_exact(bytes).map_err(|_| {
        ScriptError::resource_exceeded(format!("cannot allocate {bytes} bytes for repeat()"))
    })?;
    for _ in 0..times {
        out.push_str(text);
    }
    Ok(ScriptValue::Text(out))
}

fn sleep(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("sleep", &args, 1, 1)?;
    let seconds = args[0]
        .as_f64()
        .ok_or_else(|| type_error("sleep", "a number of seconds", &args[0]))?;
    let duration = Duration::try_from_secs_f64(seconds)
        .map_err(|_| ScriptError::execution("sleep() expects a non-negative duration"))?;
    std::thread::sleep(duration);
    Ok(ScriptValue::Null)
}

fn table_to_csv(table: &Table) -> ScriptResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    write_table(&mut writer, table)?;
    writer
        .into_inner()
        .map_err(|err| ScriptError::execution(format!("csv encoding failed: {err}")))
}

fn write_table<W: std::io::Write>(writer: &mut csv::Writer<W>, table: &Table) -> ScriptResult<()> {
    let csv_error = |err: csv::Error| ScriptError::new(ErrorKind::StorageError, err.to_string());
    writer.write_record(table.schema().names()).map_err(csv_error)?;
    for row in table.rows() {
        writer
            .write_record(row.iter().map(|cell| match cell {
                Value::Null => String::new(),
                other => other.to_string(),
            }))
            .map_err(csv_error)?;
    }
    writer
        .flush()
        .map_err(|err| ScriptError::new(ErrorKind::StorageError, err.to_string()))
}

fn artifact(ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("artifact", &args, 1, 2)?;
    let (default_type, data) = match &args[0] {
        ScriptValue::Table(table) => ("text/csv", table_to_csv(table)?),
        ScriptValue::Dataset(handle) => ("text/csv", table_to_csv(&handle.collect()?)?),
        other => ("text/plain", other.to_string().into_bytes()),
    };
    let media_type = match args.get(1) {
        Some(value) => text_arg("artifact", value)?.to_owned(),
        None => default_type.to_owned(),
    };
    let kept = ctx.emit_artifact(media_type, data);
    Ok(ScriptValue::Bool(kept))
}

fn fail(_ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("fail", &args, 0, 1)?;
    let message = args
        .first()
        .map_or_else(|| "fail() called".to_owned(), ToString::to_string);
    Err(ScriptError::execution(message))
}

fn io_error(path: &std::path::Path, err: &std::io::Error) -> ScriptError {
    ScriptError::new(
        ErrorKind::StorageError,
        format!("i/o error on `{}`: {err}", path.display()),
    )
}

fn read_text(ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("read_text", &args, 1, 1)?;
    let path = ctx.scope().path_guard().resolve(text_arg("read_text", &args[0])?)?;
    fs::read_to_string(&path)
        .map(ScriptValue::Text)
        .map_err(|err| io_error(&path, &err))
}

fn write_text(ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("write_text", &args, 2, 2)?;
    let path = ctx.scope().path_guard().resolve(text_arg("write_text", &args[0])?)?;
    let content = args[1].to_string();
    fs::write(&path, content.as_bytes()).map_err(|err| io_error(&path, &err))?;
    Ok(ScriptValue::Int(i64::try_from(content.len()).unwrap_or(i64::MAX)))
}

fn write_csv(ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("write_csv", &args, 2, 2)?;
    let path = ctx.scope().path_guard().resolve(text_arg("write_csv", &args[0])?)?;
    let table = tabular("write_csv", &args[1])?.collect()?;
    let file = fs::File::create(&path).map_err(|err| io_error(&path, &err))?;
    write_table(&mut csv::Writer::from_writer(file), &table)?;
    Ok(ScriptValue::Int(
        i64::try_from(table.row_count()).unwrap_or(i64::MAX),
    ))
}

fn list_dir(ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
    arity("list_dir", &args, 0, 1)?;
    let raw = match args.first() {
        Some(value) => text_arg("list_dir", value)?,
        None => ".",
    };
    let path = ctx.scope().path_guard().resolve(raw)?;
    let mut names = fs::read_dir(&path)
        .map_err(|err| io_error(&path, &err))?
        .map(|entry| {
            entry
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .map_err(|err| io_error(&path, &err))
        })
        .collect::<ScriptResult<Vec<_>>>()?;
    names.sort();
    Ok(ScriptValue::List(
        names.into_iter().map(ScriptValue::Text).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_specs_parse() {
        let agg = parse_aggregate("sum:amount").unwrap();
        assert_eq!(agg.func, AggFunc::Sum);
        assert_eq!(agg.column.as_deref(), Some("amount"));
        assert!(parse_aggregate("count").is_ok());
        assert!(parse_aggregate("mean").is_err());
        assert!(parse_aggregate("median:x").is_err());
    }

    #[test]
    fn list_statistics() {
        let items = vec![ScriptValue::Int(3), ScriptValue::Int(1), ScriptValue::Null];
        assert!(matches!(
            list_stat("sum", AggFunc::Sum, &items).unwrap(),
            ScriptValue::Int(4)
        ));
        assert!(matches!(
            list_stat("min", AggFunc::Min, &items).unwrap(),
            ScriptValue::Int(1)
        ));
        let ScriptValue::Float(mean) = list_stat("mean", AggFunc::Mean, &items).unwrap() else {
            panic!("mean should be a float");
        };
        assert!((mean - 2.0).abs() < f64::EPSILON);
        assert!(matches!(
            list_stat("mean", AggFunc::Mean, &[]).unwrap(),
            ScriptValue::Null
        ));
        assert!(list_stat("sum", AggFunc::Sum, &[ScriptValue::from("x")]).is_err());
    }

    #[test]
    fn csv_encoding_leaves_nulls_empty() {
        let table = Table::from_text_rows(
            vec!["a".into(), "b".into()],
            vec![vec!["1".into(), String::new()], vec!["2".into(), "x,y".into()]],
        )
        .unwrap();
        let csv = String::from_utf8(table_to_csv(&table).unwrap()).unwrap();
        assert_eq!(csv, "a,b\n1,\n2,\"x,y\"\n");
    }
}
