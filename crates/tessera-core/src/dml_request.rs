//! Per-statement DML text accumulator.

/// Column append mode of a [`GenerateDmlRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlMode {
    /// Column list of an insert; values are emitted by [`GenerateDmlRequest::close_insert`].
    InsertColumns,
    /// `col=?, col=?`
    UpdateSet,
    /// `col=? and col=?`, the first column of a where clause
    WhereId,
    /// ` and col=?` following an earlier predicate
    WhereEquals,
    /// ` and col is null`, no bind
    WhereIsNull,
}

impl DmlMode {
    /// The (prefix, separator, suffix) applied per appended column.
    pub const fn framing(self) -> (&'static str, &'static str, &'static str) {
        match self {
            DmlMode::InsertColumns => ("", ", ", ""),
            DmlMode::UpdateSet => ("", ", ", "=?"),
            DmlMode::WhereId => ("", " and ", "=?"),
            DmlMode::WhereEquals => (" and ", " and ", "=?"),
            DmlMode::WhereIsNull => (" and ", " and ", " is null"),
        }
    }

    /// Whether each appended column consumes a bind parameter.
    pub const fn binds(self) -> bool {
        !matches!(self, DmlMode::WhereIsNull)
    }
}

/// Accumulates the text of one DML statement.
///
/// Created per statement build and discarded afterwards. Bind order of the
/// finished statement is exactly the order columns were appended in
/// bind-requiring modes.
#[derive(Debug, Clone)]
pub struct GenerateDmlRequest {
    sql: String,
    mode: DmlMode,
    first_in_mode: bool,
    bind_count: usize,
    insert_columns: usize,
}

impl Default for GenerateDmlRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerateDmlRequest {
    pub fn new() -> Self {
        Self {
            sql: String::new(),
            mode: DmlMode::InsertColumns,
            first_in_mode: true,
            bind_count: 0,
            insert_columns: 0,
        }
    }

    fn set_mode(&mut self, mode: DmlMode) {
        self.mode = mode;
        self.first_in_mode = true;
    }

    pub fn set_insert_mode(&mut self) {
        self.set_mode(DmlMode::InsertColumns);
    }

    pub fn set_update_set_mode(&mut self) {
        self.set_mode(DmlMode::UpdateSet);
    }

    pub fn set_where_id_mode(&mut self) {
        self.set_mode(DmlMode::WhereId);
    }

    pub fn set_where_mode(&mut self) {
        self.set_mode(DmlMode::WhereEquals);
    }

    pub fn set_where_is_null_mode(&mut self) {
        self.set_mode(DmlMode::WhereIsNull);
    }

    pub fn mode(&self) -> DmlMode {
        self.mode
    }

    /// Append raw text.
    pub fn append(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    /// Append one column in the current mode.
    pub fn append_column(&mut self, column: &str) {
        let (prefix, separator, suffix) = self.mode.framing();
        self.sql
            .push_str(if self.first_in_mode { prefix } else { separator });
        self.first_in_mode = false;
        self.sql.push_str(column);
        self.sql.push_str(suffix);
        if self.mode == DmlMode::InsertColumns {
            self.insert_columns += 1;
        }
        if self.mode.binds() {
            self.bind_count += 1;
        }
    }

    /// Close an insert column list: `) values (?, ?, ...)`.
    pub fn close_insert(&mut self) {
        self.sql.push_str(") values (");
        self.sql
            .push_str(&vec!["?"; self.insert_columns].join(", "));
        self.sql.push(')');
    }

    /// Parameters required so far.
    pub fn bind_count(&self) -> usize {
        self.bind_count
    }

    /// Columns appended so far in insert mode.
    pub fn insert_column_count(&self) -> usize {
        self.insert_columns
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn into_sql(self) -> String {
        self.sql
    }
}
