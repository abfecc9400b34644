//! The Python runner placed in `.sandbox/runner.py` for every execution, and
//! the parser for what it prints.
//!
//! The runner's raw stdout carries only framed lines: zero or more
//! `__SANDBOX_EVENT__{json}` lines while streaming, then one
//! `__SANDBOX_RESULT__{json}` line. User output is captured inside the
//! interpreter and travels in those frames.

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RESULT_MARKER: &str = "__SANDBOX_RESULT__";
pub const EVENT_MARKER: &str = "__SANDBOX_EVENT__";

pub const RUNNER_FILE: &str = "runner.py";
pub const USER_CODE_FILE: &str = "user_code.py";
pub const VARIABLES_FILE: &str = "variables.json";

/// Values baked into the generated runner
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    pub execution_id: String,
    /// Root modules user code may never import
    pub blocked_modules: Vec<String>,
    /// When set, the only root modules user code may import
    pub allowed_modules: Option<Vec<String>>,
    /// Per-stream cap on captured stdout/stderr characters
    pub max_output_bytes: usize,
    pub max_plots: usize,
    /// Larger PNGs are saved but not returned inline
    pub max_plot_bytes: usize,
    pub max_variable_bytes: usize,
    /// Shared by variables, data objects and unserializable entries
    pub max_variables_total_bytes: usize,
    /// Emit event frames as output is produced
    pub stream: bool,
}

/// Render the runner script for one execution.
pub fn render(config: &RunnerConfig) -> Result<String> {
    let config_json = serde_json::to_string(config)?;
    // A JSON string literal is also a valid Python string literal.
    let literal = serde_json::to_string(&config_json)?;
    Ok(RUNNER_TEMPLATE.replace("__SANDBOX_CONFIG__", &literal))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub traceback: String,
}

/// The decoded `__SANDBOX_RESULT__` payload
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerOutput {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub truncated: bool,
    /// JSON-representable user globals after the run
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Globals that could not be carried over: name -> {type, repr}
    #[serde(default)]
    pub unserializable: Map<String, Value>,
    /// numpy / pandas globals described for display: name -> descriptor.
    /// They are not carried into the next execution.
    #[serde(default)]
    pub data_objects: Map<String, Value>,
    #[serde(default)]
    pub plots: Vec<String>,
    #[serde(default)]
    pub plot_data: Vec<PlotImage>,
    #[serde(default)]
    pub error: Option<RunnerError>,
    /// Seconds
    #[serde(default)]
    pub execution_time: f64,
    /// Seconds of CPU consumed by the interpreter
    #[serde(default)]
    pub cpu_time: f64,
    /// Peak RSS in bytes
    #[serde(default)]
    pub memory_usage: u64,
    /// Bytes held by user globals when the run ended
    #[serde(default)]
    pub variable_memory: u64,
}

/// A saved figure returned inline
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlotImage {
    /// VFS path of the same image
    pub path: String,
    pub format: String,
    /// Base64 of the image bytes
    pub data: String,
    /// Inches
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub dpi: f64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub xlabel: String,
    #[serde(default)]
    pub ylabel: String,
}

impl RunnerOutput {
    /// The frame the runner prints for this output
    pub fn to_result_line(&self) -> Result<String> {
        Ok(format!("{}{}", RESULT_MARKER, serde_json::to_string(self)?))
    }
}

/// Extract the result from the runner's raw stdout. The last result frame
/// wins; `Err` carries the reason the output could not be decoded.
pub fn parse_output(stdout: &str) -> std::result::Result<RunnerOutput, String> {
    let line = stdout
        .lines()
        .rev()
        .find_map(|line| line.trim_end_matches('\r').strip_prefix(RESULT_MARKER))
        .ok_or_else(|| "runner produced no result frame".to_string())?;
    serde_json::from_str(line).map_err(|e| format!("invalid result frame: {e}"))
}

/// One streamed frame
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RunnerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Decode an event frame; anything else (including result frames) is `None`.
pub fn parse_event_line(line: &str) -> Option<RunnerEvent> {
    let payload = line.strip_prefix(EVENT_MARKER)?;
    serde_json::from_str(payload).ok()
}

const RUNNER_TEMPLATE: &str = r##"import base64
import builtins
import io
import json
import os
import reprlib
import sys
import time
import traceback

try:
    import resource
except ImportError:
    resource = None

_CONFIG = json.loads(__SANDBOX_CONFIG__)
_SANDBOX_DIR = os.path.dirname(os.path.realpath(__file__))
_WORKSPACE = os.path.dirname(_SANDBOX_DIR)
_TMP = os.path.realpath("/tmp")
_REAL_STDOUT = sys.stdout
_REAL_STDERR = sys.stderr
_MODULE = type(sys)
_ERROR_TEXT_LIMIT = 64 * 1024
_INLINE_ELEMENTS = 1000
_INLINE_ROWS = 100
_INLINE_COLUMNS = 20

os.chdir(_WORKSPACE)
sys.path.insert(0, os.path.join(_SANDBOX_DIR, "site-packages"))
os.environ.setdefault("MPLBACKEND", "Agg")

_repr = reprlib.Repr()
_repr.maxstring = 200
_repr.maxother = 200


def _emit(kind, data):
    if not _CONFIG["stream"]:
        return
    _REAL_STDOUT.write("__SANDBOX_EVENT__" + json.dumps({"type": kind, "data": data}) + "\n")
    _REAL_STDOUT.flush()


class _Capture(io.TextIOBase):
    encoding = "utf-8"

    def __init__(self, kind, limit):
        super().__init__()
        self.kind = kind
        self.limit = limit
        self.parts = []
        self.size = 0
        self.truncated = False

    def writable(self):
        return True

    def write(self, text):
        if not isinstance(text, str):
            text = str(text)
        if not text:
            return 0
        room = self.limit - self.size
        if room <= 0:
            self.truncated = True
            return len(text)
        chunk = text[:room]
        if len(chunk) < len(text):
            self.truncated = True
        self.parts.append(chunk)
        self.size += len(chunk)
        _emit(self.kind, chunk)
        return len(text)

    def getvalue(self):
        return "".join(self.parts)


_BLOCKED = set(_CONFIG["blockedModules"])
_ALLOWED = set(_CONFIG["allowedModules"]) if _CONFIG["allowedModules"] is not None else None
_original_import = builtins.__import__
_original_open = builtins.open


def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level == 0:
        root = name.split(".")[0]
        if root in _BLOCKED:
            raise ImportError(f"Module '{root}' is blocked in the sandbox")
        if _ALLOWED is not None and root not in _ALLOWED:
            raise ImportError(f"Module '{root}' is not in the allowed module list")
    return _original_import(name, globals, locals, fromlist, level)


def _refuse(name):
    def refused(*args, **kwargs):
        raise PermissionError(f"'{name}' is not available in the sandbox")

    refused.__name__ = name
    return refused


def _is_dunder(name):
    return isinstance(name, str) and name.startswith("__") and name.endswith("__")


def _safe_getattr(obj, name, *default):
    if _is_dunder(name):
        raise PermissionError(f"dynamic access to '{name}' is not allowed")
    value = getattr(obj, name, *default)
    if isinstance(value, _MODULE) and value.__name__.split(".")[0] in _BLOCKED:
        raise PermissionError(f"Module '{value.__name__}' is blocked in the sandbox")
    return value


def _safe_setattr(obj, name, value):
    if _is_dunder(name):
        raise PermissionError(f"dynamic access to '{name}' is not allowed")
    setattr(obj, name, value)


def _safe_delattr(obj, name):
    if _is_dunder(name):
        raise PermissionError(f"dynamic access to '{name}' is not allowed")
    delattr(obj, name)


def _within(path, root):
    return path == root or path.startswith(root + os.sep)


def _safe_open(file, mode="r", *args, **kwargs):
    if isinstance(file, int):
        raise PermissionError("opening raw file descriptors is not allowed")
    path = os.path.realpath(os.fsdecode(os.fspath(file)))
    if _within(path, _SANDBOX_DIR) or not (_within(path, _WORKSPACE) or _within(path, _TMP)):
        raise PermissionError(f"access denied to file: {file}")
    return _original_open(file, mode, *args, **kwargs)


def _user_builtins():
    table = dict(builtins.__dict__)
    for name in ("eval", "exec", "compile", "input", "breakpoint", "globals", "locals", "vars", "help"):
        table[name] = _refuse(name)
    table["__import__"] = _guarded_import
    table["getattr"] = _safe_getattr
    table["setattr"] = _safe_setattr
    table["delattr"] = _safe_delattr
    table["open"] = _safe_open
    return table


def _load_variables():
    path = os.path.join(_SANDBOX_DIR, "variables.json")
    if not os.path.exists(path):
        return {}
    with open(path, "r", encoding="utf-8") as fh:
        data = json.load(fh)
    return data if isinstance(data, dict) else {}


def _preview(value):
    try:
        return _repr.repr(value)[:200]
    except Exception:
        return "<unrepresentable>"


def _clip(text):
    if len(text) <= _ERROR_TEXT_LIMIT:
        return text
    return text[:_ERROR_TEXT_LIMIT] + "... [truncated]"


def _finite(value):
    if isinstance(value, float):
        return value if value == value and value not in (float("inf"), float("-inf")) else None
    if value is None or isinstance(value, (str, int, bool)):
        return value
    if isinstance(value, (list, tuple)):
        return [_finite(item) for item in value]
    if isinstance(value, dict):
        return {str(key): _finite(item) for key, item in value.items()}
    if hasattr(value, "item"):
        try:
            return _finite(value.item())
        except Exception:
            pass
    return str(value)


def _describe_array(arr):
    info = {
        "type": "numpy.ndarray",
        "dtype": str(arr.dtype),
        "shape": list(arr.shape),
        "size": int(arr.size),
        "memoryUsage": int(arr.nbytes),
    }
    if arr.size <= _INLINE_ELEMENTS:
        info["data"] = _finite(arr.tolist())
        return info
    info["truncated"] = True
    info["preview"] = _finite(arr.ravel()[:10].tolist())
    if arr.dtype.kind in "biuf":
        info["statistics"] = _finite(
            {"min": arr.min(), "max": arr.max(), "mean": arr.mean(), "std": arr.std()}
        )
    return info


def _describe_frame(df):
    info = {
        "type": "pandas.DataFrame",
        "shape": list(df.shape),
        "columns": [str(column) for column in df.columns],
        "dtypes": {str(column): str(dtype) for column, dtype in df.dtypes.items()},
        "memoryUsage": int(df.memory_usage(deep=True).sum()),
    }
    if len(df) <= _INLINE_ROWS and len(df.columns) <= _INLINE_COLUMNS:
        info["index"] = _finite(df.index.tolist())
        info["data"] = _finite(df.to_dict("records"))
        return info
    info["truncated"] = True
    info["head"] = _finite(df.head().iloc[:, :_INLINE_COLUMNS].to_dict("records"))
    info["tail"] = _finite(df.tail().iloc[:, :_INLINE_COLUMNS].to_dict("records"))
    return info


def _describe_series(series):
    info = {
        "type": "pandas.Series",
        "name": _finite(series.name),
        "dtype": str(series.dtype),
        "length": int(len(series)),
        "memoryUsage": int(series.memory_usage(deep=True)),
    }
    if len(series) <= _INLINE_ROWS:
        info["index"] = _finite(series.index.tolist())
        info["data"] = _finite(series.tolist())
        return info
    info["truncated"] = True
    info["head"] = _finite(series.head().tolist())
    info["tail"] = _finite(series.tail().tolist())
    return info


def _describe_rich(value):
    numpy = sys.modules.get("numpy")
    if numpy is not None and isinstance(value, numpy.ndarray):
        return _describe_array(value)
    pandas = sys.modules.get("pandas")
    if pandas is not None:
        if isinstance(value, pandas.DataFrame):
            return _describe_frame(value)
        if isinstance(value, pandas.Series):
            return _describe_series(value)
    return None


def _sizeof(value):
    try:
        return sys.getsizeof(value)
    except Exception:
        return 0


def _export(namespace):
    per_value = _CONFIG["maxVariableBytes"]
    budget = _CONFIG["maxVariablesTotalBytes"]
    exported = {}
    objects = {}
    skipped = {}
    used = 0
    held = 0

    for name, value in list(namespace.items()):
        if name.startswith("_"):
            continue
        if isinstance(value, _MODULE) or callable(value):
            continue
        reason = None
        try:
            rich = _describe_rich(value)
        except Exception as exc:
            rich = None
            reason = "could not be described: %s" % _preview(exc)
        held += rich["memoryUsage"] if rich is not None else _sizeof(value)
        payload = rich if rich is not None else value
        size = 0
        if reason is None:
            try:
                size = len(json.dumps(payload, allow_nan=False))
            except (TypeError, ValueError, OverflowError, RecursionError):
                reason = "not JSON-serializable"
        if reason is None and size > per_value:
            reason = "encoded size %d exceeds the %d byte limit" % (size, per_value)
        if reason is None and used + size > budget:
            reason = "result size budget exhausted"
        if reason is None:
            used += size
            (objects if rich is not None else exported)[name] = payload
            continue
        entry = {"type": type(value).__name__, "repr": _preview(value), "reason": reason}
        cost = len(name) + len(json.dumps(entry))
        if used + cost <= budget:
            used += cost
            skipped[name] = entry
    return exported, objects, skipped, held


def _plot_payload(figure, path, png):
    axes = figure.axes[0] if figure.axes else None
    return {
        "path": path,
        "format": "png",
        "data": base64.b64encode(png).decode("ascii"),
        "width": float(figure.get_figwidth()),
        "height": float(figure.get_figheight()),
        "dpi": float(figure.dpi),
        "title": axes.get_title() if axes is not None else "",
        "xlabel": axes.get_xlabel() if axes is not None else "",
        "ylabel": axes.get_ylabel() if axes is not None else "",
    }


def _save_plots(stderr):
    pyplot = sys.modules.get("matplotlib.pyplot")
    if pyplot is None:
        return [], []
    saved = []
    inline = []
    try:
        plot_dir = os.path.join(_WORKSPACE, "output", "plots")
        os.makedirs(plot_dir, exist_ok=True)
        numbers = pyplot.get_fignums()[: _CONFIG["maxPlots"]]
        for index, number in enumerate(numbers, start=1):
            figure = pyplot.figure(number)
            buffer = io.BytesIO()
            figure.savefig(buffer, format="png", bbox_inches="tight")
            png = buffer.getvalue()
            name = "plot_%s_%d.png" % (_CONFIG["executionId"][:8], index)
            with open(os.path.join(plot_dir, name), "wb") as fh:
                fh.write(png)
            path = "/output/plots/" + name
            saved.append(path)
            _emit("plot", path)
            if len(png) <= _CONFIG["maxPlotBytes"]:
                inline.append(_plot_payload(figure, path, png))
            else:
                stderr.write("plot %s is %d bytes; returned by path only\n" % (path, len(png)))
        pyplot.close("all")
    except Exception as exc:
        stderr.write("failed to save plots: %s\n" % exc)
    return saved, inline


def _error(exc, with_traceback=True):
    trace = ""
    if with_traceback:
        tb = exc.__traceback__.tb_next if exc.__traceback__ is not None else None
        trace = "".join(traceback.format_exception(type(exc), exc, tb))
    try:
        message = str(exc)
    except Exception:
        message = "<unprintable %s>" % type(exc).__name__
    return {"type": type(exc).__name__, "message": _clip(message), "traceback": _clip(trace)}


def _main():
    limit = _CONFIG["maxOutputBytes"]
    stdout = _Capture("stdout", limit)
    stderr = _Capture("stderr", limit)
    namespace = {"__name__": "__sandbox__", "__builtins__": _user_builtins()}
    success = True
    error = None

    try:
        namespace.update(_load_variables())
    except Exception as exc:
        success = False
        error = _error(exc)

    with open(os.path.join(_SANDBOX_DIR, "user_code.py"), "r", encoding="utf-8") as fh:
        source = fh.read()

    started = time.perf_counter()
    cpu_started = time.process_time()
    if success:
        sys.stdout, sys.stderr = stdout, stderr
        try:
            exec(compile(source, "<sandbox>", "exec"), namespace)
        except SystemExit as exc:
            if exc.code not in (None, 0):
                success = False
                error = {"type": "SystemExit", "message": "exit code %s" % exc.code, "traceback": ""}
        except MemoryError as exc:
            success = False
            error = _error(exc, with_traceback=False)
            error["message"] = "execution exceeded the memory limit"
        except BaseException as exc:
            success = False
            error = _error(exc)
        finally:
            sys.stdout, sys.stderr = _REAL_STDOUT, _REAL_STDERR
    elapsed = time.perf_counter() - started
    cpu = time.process_time() - cpu_started

    plots, plot_data = _save_plots(stderr)
    variables, data_objects, unserializable, held = _export(namespace)
    memory = 0
    if resource is not None:
        memory = resource.getrusage(resource.RUSAGE_SELF).ru_maxrss * 1024

    result = {
        "success": success,
        "stdout": stdout.getvalue(),
        "stderr": stderr.getvalue(),
        "truncated": stdout.truncated or stderr.truncated,
        "variables": variables,
        "dataObjects": data_objects,
        "unserializable": unserializable,
        "plots": plots,
        "plotData": plot_data,
        "error": error,
        "executionTime": elapsed,
        "cpuTime": cpu,
        "memoryUsage": memory,
        "variableMemory": held,
    }
    _REAL_STDOUT.write("__SANDBOX_RESULT__" + json.dumps(result) + "\n")
    _REAL_STDOUT.flush()


_main()
"##;
