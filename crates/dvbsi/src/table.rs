//! 複数セクションからなる論理テーブル。

use thiserror::Error;

use crate::psi::{Section, MAX_LONG_PAYLOAD_SIZE};

/// [`BinaryTable`]の組み立てで発生するエラー。
#[derive(Debug, Error)]
pub enum TableError {
    /// セクションが1つもない。
    #[error("no section")]
    Empty,

    /// 短形式セクションはテーブルを構成できない。
    #[error("short section in a table")]
    ShortSection,

    /// テーブル識別・テーブル識別拡張・バージョンがセクション間で一致しない。
    #[error("inconsistent section")]
    Inconsistent,

    /// セクション番号が0から連続していない。
    #[error("broken section numbering")]
    BrokenNumbering,
}

/// 1つの論理テーブルを構成する、順序付けられたセクションの集まり。
///
/// 全セクションはテーブル識別・テーブル識別拡張・バージョンを共有し、
/// セクション番号は0から最終セクション番号まで連続する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryTable {
    sections: Vec<Section>,
}

impl BinaryTable {
    /// `sections`から`BinaryTable`を生成する。
    pub fn from_sections(sections: Vec<Section>) -> Result<BinaryTable, TableError> {
        if sections.is_empty() {
            return Err(TableError::Empty);
        }
        if sections.iter().any(Section::is_short_section) {
            return Err(TableError::ShortSection);
        }

        let first = &sections[0];
        let last = sections.len() - 1;
        if sections.iter().any(|section| {
            section.table_id() != first.table_id()
                || section.table_id_extension() != first.table_id_extension()
                || section.version_number() != first.version_number()
                || section.current_next_indicator() != first.current_next_indicator()
                || section.last_section_number() as usize != last
        }) {
            return Err(TableError::Inconsistent);
        }
        if sections
            .iter()
            .enumerate()
            .any(|(i, section)| section.section_number() as usize != i)
        {
            return Err(TableError::BrokenNumbering);
        }

        Ok(BinaryTable { sections })
    }

    /// テーブル識別を返す。
    #[inline]
    pub fn table_id(&self) -> u8 {
        self.sections[0].table_id()
    }

    /// テーブル識別拡張を返す。
    #[inline]
    pub fn table_id_extension(&self) -> u16 {
        self.sections[0].table_id_extension()
    }

    /// バージョン番号を返す。
    #[inline]
    pub fn version_number(&self) -> u8 {
        self.sections[0].version_number()
    }

    /// セクション数を返す。
    #[inline]
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// セクション一覧を返す。
    #[inline]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// テーブルを消費してセクション一覧を返す。
    #[inline]
    pub fn into_sections(self) -> Vec<Section> {
        self.sections
    }
}

/// 論理テーブルをセクション列に直列化する。
///
/// 繰り返し要素を[`TableBuilder::push_entry`]で追加していき、現在のセクションに
/// 収まらなくなった時点でセクションを閉じ、固定部を再掲した次のセクションを
/// 開く。要素が1つもなくてもセクションは必ず1つ生成される。
#[derive(Debug)]
pub struct TableBuilder {
    table_id: u8,
    table_id_extension: u16,
    version_number: u8,
    current_next_indicator: bool,
    /// 各セクションの先頭に再掲される固定部。
    fixed: Vec<u8>,
    /// セクション1つ分のペイロード上限。
    max_payload: usize,
    sealed: Vec<Vec<u8>>,
    current: Vec<u8>,
    truncated: bool,
}

impl TableBuilder {
    /// `TableBuilder`を生成する。
    ///
    /// `fixed`は全セクションの先頭に繰り返されるペイロードの固定部である。
    ///
    /// # パニック
    ///
    /// `fixed`がセクション1つ分のペイロード上限以上の際、またはバージョンが
    /// 31を超える際はパニックする。
    pub fn new(table_id: u8, table_id_extension: u16, version_number: u8, fixed: &[u8]) -> TableBuilder {
        TableBuilder::with_max_payload(
            table_id,
            table_id_extension,
            version_number,
            fixed,
            MAX_LONG_PAYLOAD_SIZE,
        )
    }

    /// ペイロード上限を指定して`TableBuilder`を生成する。
    ///
    /// # パニック
    ///
    /// 上限が[`MAX_LONG_PAYLOAD_SIZE`]を超える場合や`fixed`が上限以上の際、
    /// またはバージョンが31を超える際はパニックする。
    pub fn with_max_payload(
        table_id: u8,
        table_id_extension: u16,
        version_number: u8,
        fixed: &[u8],
        max_payload: usize,
    ) -> TableBuilder {
        assert!(version_number < 32);
        assert!(max_payload <= MAX_LONG_PAYLOAD_SIZE);
        assert!(fixed.len() < max_payload);

        TableBuilder {
            table_id,
            table_id_extension,
            version_number,
            current_next_indicator: true,
            fixed: fixed.to_vec(),
            max_payload,
            sealed: Vec::new(),
            current: fixed.to_vec(),
            truncated: false,
        }
    }

    /// カレントネクスト指示を設定する。既定値は`true`。
    pub fn set_current_next_indicator(&mut self, current_next_indicator: bool) {
        self.current_next_indicator = current_next_indicator;
    }

    /// 繰り返し要素を1つ追加する。
    ///
    /// 現在のセクションの残りに収まらない場合はセクションを区切る。
    /// ちょうど収まる要素は現在のセクションに入る。単独でセクションに
    /// 収まらない要素は収まる分だけ書き込んで切り詰める。
    pub fn push_entry(&mut self, entry: &[u8]) {
        if self.current.len() + entry.len() <= self.max_payload {
            self.current.extend_from_slice(entry);
            return;
        }

        self.seal();
        if self.current.len() + entry.len() <= self.max_payload {
            self.current.extend_from_slice(entry);
        } else {
            // 新しいセクションにも収まらない要素は切り詰める
            let room = self.max_payload - self.current.len();
            log::warn!(
                "table entry too large: table_id={:#04X} entry={} room={}",
                self.table_id,
                entry.len(),
                room,
            );
            self.current.extend_from_slice(&entry[..room]);
            self.truncated = true;
            self.seal();
        }
    }

    fn seal(&mut self) {
        let payload = std::mem::replace(&mut self.current, self.fixed.clone());
        self.sealed.push(payload);
    }

    /// いずれかの要素が切り詰められたかどうかを返す。
    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// 全セクションを確定して[`BinaryTable`]を返す。
    ///
    /// セクション番号と最終セクション番号が振られ、各セクションのCRC32が
    /// 計算される。
    pub fn finish(mut self) -> BinaryTable {
        // 要素追加後に区切られた直後でなければ、末尾のセクションを確定する
        if self.sealed.is_empty() || self.current.len() > self.fixed.len() {
            self.seal();
        }

        if self.sealed.len() > 256 {
            log::warn!(
                "too many sections: table_id={:#04X} count={}",
                self.table_id,
                self.sealed.len(),
            );
            self.sealed.truncate(256);
        }

        let last = (self.sealed.len() - 1) as u8;
        let sections = self
            .sealed
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                Section::new_long(
                    self.table_id,
                    true,
                    self.table_id_extension,
                    self.version_number,
                    self.current_next_indicator,
                    i as u8,
                    last,
                    payload,
                )
            })
            .collect();

        BinaryTable { sections }
    }
}
