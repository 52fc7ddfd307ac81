//! Python 2 → 3 import remapping, consulted for protocol < 3 streams when
//! `fix_imports` is enabled. The exact (module, name) table is checked first,
//! then the module table.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

/// Exact (module, name) pairs that moved.
pub static NAME_MAPPING: Lazy<BTreeMap<(&'static str, &'static str), (&'static str, &'static str)>> =
    Lazy::new(|| {
        BTreeMap::from([
            (("__builtin__", "xrange"), ("builtins", "range")),
            (("__builtin__", "reduce"), ("functools", "reduce")),
            (("__builtin__", "intern"), ("sys", "intern")),
            (("__builtin__", "unichr"), ("builtins", "chr")),
            (("__builtin__", "unicode"), ("builtins", "str")),
            (("__builtin__", "long"), ("builtins", "int")),
            (("__builtin__", "basestring"), ("builtins", "str")),
            (("__builtin__", "buffer"), ("builtins", "memoryview")),
            (("__builtin__", "file"), ("io", "open")),
            (("__builtin__", "StandardError"), ("builtins", "Exception")),
            (("exceptions", "StandardError"), ("builtins", "Exception")),
            (("UserDict", "UserDict"), ("collections", "UserDict")),
            (("UserDict", "IterableUserDict"), ("collections", "UserDict")),
            (("UserList", "UserList"), ("collections", "UserList")),
            (("UserString", "UserString"), ("collections", "UserString")),
            (("whichdb", "whichdb"), ("dbm", "whichdb")),
            (("itertools", "izip"), ("builtins", "zip")),
            (("itertools", "imap"), ("builtins", "map")),
            (("itertools", "ifilter"), ("builtins", "filter")),
            (("itertools", "izip_longest"), ("itertools", "zip_longest")),
            (("itertools", "ifilterfalse"), ("itertools", "filterfalse")),
        ])
    });

/// Whole modules that were renamed.
pub static IMPORT_MAPPING: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("__builtin__", "builtins"),
        ("copy_reg", "copyreg"),
        ("Queue", "queue"),
        ("SocketServer", "socketserver"),
        ("ConfigParser", "configparser"),
        ("repr", "reprlib"),
        ("tkFileDialog", "tkinter.filedialog"),
        ("tkSimpleDialog", "tkinter.simpledialog"),
        ("tkColorChooser", "tkinter.colorchooser"),
        ("tkCommonDialog", "tkinter.commondialog"),
        ("Tkinter", "tkinter"),
        ("markupbase", "_markupbase"),
        ("_winreg", "winreg"),
        ("thread", "_thread"),
        ("dummy_thread", "_dummy_thread"),
        ("dbhash", "dbm.bsd"),
        ("dumbdbm", "dbm.dumb"),
        ("anydbm", "dbm"),
        ("gdbm", "dbm.gnu"),
        ("StringIO", "io"),
        ("cStringIO", "io"),
        ("cPickle", "pickle"),
        ("htmlentitydefs", "html.entities"),
        ("HTMLParser", "html.parser"),
        ("Cookie", "http.cookies"),
        ("cookielib", "http.cookiejar"),
        ("BaseHTTPServer", "http.server"),
        ("SimpleHTTPServer", "http.server"),
        ("CGIHTTPServer", "http.server"),
        ("urlparse", "urllib.parse"),
        ("xmlrpclib", "xmlrpc.client"),
    ])
});

/// Apply the remapping: exact pair first, then module-only.
pub fn remap(module: &str, name: &str) -> (String, String) {
    if let Some((m, n)) = NAME_MAPPING.get(&(module, name)) {
        ((*m).to_owned(), (*n).to_owned())
    } else if let Some(m) = IMPORT_MAPPING.get(module) {
        ((*m).to_owned(), name.to_owned())
    } else {
        (module.to_owned(), name.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pair_wins_over_module() {
        assert_eq!(
            remap("__builtin__", "xrange"),
            ("builtins".into(), "range".into())
        );
        // module mapping applies when there is no exact pair
        assert_eq!(
            remap("__builtin__", "object"),
            ("builtins".into(), "object".into())
        );
    }

    #[test]
    fn unmapped_names_pass_through() {
        assert_eq!(remap("os", "path"), ("os".into(), "path".into()));
    }
}
