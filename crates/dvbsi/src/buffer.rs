//! ビット単位のカーソルを持つバッファ。
//!
//! セクションやその内部構造のような、バイト列の中にビット粒度のフィールドが
//! 混在するデータを読み書きするためのモジュール。読み取りと書き込みは独立した
//! ビット位置を持ち、長さフィールドで区切られる入れ子の領域を
//! [`BitBuffer::push_read_length`]・[`BitBuffer::push_write_length`]で辿れる。
//!
//! 破損した放送データを入力とするため、範囲外の読み取りはパニックせず
//! 値0を返してエラーフラグを立てる。呼び出し側は一連の操作を終えた後に
//! [`BitBuffer::error`]でレコード全体の正当性を判断する。

use smallvec::SmallVec;

/// 保存された領域の状態。
#[derive(Debug, Clone, Copy)]
enum State {
    /// [`BitBuffer::push_state`]による全状態の保存。
    Full {
        read_bit: usize,
        write_bit: usize,
        read_end: usize,
    },
    /// 長さフィールドから作った読み取り領域。
    Read { outer_end: usize },
    /// 先頭に長さフィールドの場所を予約した書き込み列。
    WriteLength { pos: usize, width: usize },
}

/// ビット単位で読み書きするカーソル付きバッファ。
///
/// ビット列はビッグエンディアン（MSBが先）として扱う。
#[derive(Debug, Clone)]
pub struct BitBuffer {
    data: Vec<u8>,
    /// 読み取りビット位置。
    read_bit: usize,
    /// 書き込みビット位置。
    write_bit: usize,
    /// 現在の読み取り上限（ビット）。
    read_end: usize,
    /// これまでに書き込まれた終端（ビット）。
    written_end: usize,
    /// バイト単位の上限。`None`なら際限なく伸長する。
    max_size: Option<usize>,
    states: SmallVec<[State; 4]>,
    /// 積まれている読み取り領域の数。
    read_regions: usize,
    read_error: bool,
    write_error: bool,
    user_error: bool,
}

impl BitBuffer {
    /// 空の伸長可能なバッファを生成する。
    pub fn new() -> BitBuffer {
        BitBuffer::with_vec(Vec::new())
    }

    /// `max_size`バイトを上限とする空のバッファを生成する。
    ///
    /// 上限を超える書き込みは書き込みエラーとなる。
    pub fn with_max_size(max_size: usize) -> BitBuffer {
        BitBuffer {
            max_size: Some(max_size),
            ..BitBuffer::new()
        }
    }

    /// `data`を読み取るバッファを生成する。
    ///
    /// 読み取り位置は先頭、書き込み位置は終端となる。
    pub fn from_vec(data: Vec<u8>) -> BitBuffer {
        let bits = data.len() * 8;
        BitBuffer {
            data,
            read_bit: 0,
            write_bit: bits,
            read_end: bits,
            written_end: bits,
            max_size: None,
            states: SmallVec::new(),
            read_regions: 0,
            read_error: false,
            write_error: false,
            user_error: false,
        }
    }

    /// `data`のコピーを読み取るバッファを生成する。
    #[inline]
    pub fn from_bytes(data: &[u8]) -> BitBuffer {
        BitBuffer::from_vec(data.to_vec())
    }

    fn with_vec(data: Vec<u8>) -> BitBuffer {
        BitBuffer {
            data,
            read_bit: 0,
            write_bit: 0,
            read_end: 0,
            written_end: 0,
            max_size: None,
            states: SmallVec::new(),
            read_regions: 0,
            read_error: false,
            write_error: false,
            user_error: false,
        }
    }

    /// バッファを消費して書き込まれたバイト列を返す。
    ///
    /// 末尾の中途半端なビットはバイト境界まで0詰めで含まれる。
    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.truncate((self.written_end + 7) / 8);
        self.data
    }

    /// 書き込まれたバイト列を返す。
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..(self.written_end + 7) / 8]
    }

    /// 読み取りビット位置を返す。
    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_bit
    }

    /// 書き込みビット位置を返す。
    #[inline]
    pub fn write_position(&self) -> usize {
        self.write_bit
    }

    /// 現在の領域で残っている読み取り可能なビット数を返す。
    #[inline]
    pub fn remaining_read_bits(&self) -> usize {
        self.read_end - self.read_bit
    }

    /// 現在の領域で残っている読み取り可能なバイト数を返す。
    #[inline]
    pub fn remaining_read_bytes(&self) -> usize {
        self.remaining_read_bits() / 8
    }

    /// `bits`ビットを読み取れるかどうかを返す。エラー状態では常に`false`。
    #[inline]
    pub fn can_read(&self, bits: usize) -> bool {
        !self.read_error && bits <= self.remaining_read_bits()
    }

    /// `len`バイトを読み取れるかどうかを返す。エラー状態では常に`false`。
    #[inline]
    pub fn can_read_bytes(&self, len: usize) -> bool {
        !self.read_error && len.checked_mul(8).map_or(false, |b| b <= self.remaining_read_bits())
    }

    /// 読み取り位置を`bit`に移動する。範囲外なら読み取りエラーとなる。
    pub fn read_seek(&mut self, bit: usize) {
        if bit > self.read_end {
            self.read_error = true;
        } else {
            self.read_bit = bit;
        }
    }

    /// 書き込み位置を`bit`に移動する。
    ///
    /// 既に書き込まれた範囲しか指定できず、範囲外なら書き込みエラーとなる。
    pub fn write_seek(&mut self, bit: usize) {
        if bit > self.written_end {
            self.write_error = true;
        } else {
            self.write_bit = bit;
        }
    }

    /// `bits`ビットの読み取りを飛ばす。残りが足りなければ読み取りエラーとなる。
    pub fn skip_bits(&mut self, bits: usize) {
        if bits > self.remaining_read_bits() {
            self.read_bit = self.read_end;
            self.read_error = true;
        } else {
            self.read_bit += bits;
        }
    }

    /// `width`ビット（最大64）をビッグエンディアンで読み取る。
    ///
    /// 残りが足りない場合は0を返して読み取りエラーとなる。
    pub fn get_bits(&mut self, width: usize) -> u64 {
        if width == 0 {
            return 0;
        }
        if width > 64 || !self.can_read(width) {
            self.read_error = true;
            return 0;
        }

        let value = extract(&self.data, self.read_bit, width);
        self.read_bit += width;
        value
    }

    /// 1ビットを読み取る。
    #[inline]
    pub fn get_bit(&mut self) -> bool {
        self.get_bits(1) != 0
    }

    /// 8ビット整数を読み取る。
    #[inline]
    pub fn get_u8(&mut self) -> u8 {
        self.get_bits(8) as u8
    }

    /// 16ビット整数をビッグエンディアンで読み取る。
    #[inline]
    pub fn get_u16(&mut self) -> u16 {
        self.get_bits(16) as u16
    }

    /// 24ビット整数をビッグエンディアンで読み取る。
    #[inline]
    pub fn get_u24(&mut self) -> u32 {
        self.get_bits(24) as u32
    }

    /// 32ビット整数をビッグエンディアンで読み取る。
    #[inline]
    pub fn get_u32(&mut self) -> u32 {
        self.get_bits(32) as u32
    }

    /// `len`バイトを読み取る。
    ///
    /// 残りが足りない場合は0で埋めた`len`バイトを返して読み取りエラーとなる。
    pub fn get_bytes(&mut self, len: usize) -> Vec<u8> {
        if !self.can_read_bytes(len) {
            self.read_error = true;
            return vec![0; len];
        }

        if self.read_bit % 8 == 0 {
            let start = self.read_bit / 8;
            let v = self.data[start..start + len].to_vec();
            self.read_bit += len * 8;
            v
        } else {
            (0..len).map(|_| self.get_bits(8) as u8).collect()
        }
    }

    #[inline]
    fn advance_write(&mut self) {
        self.written_end = self.written_end.max(self.write_bit);
        if self.read_regions == 0 {
            self.read_end = self.read_end.max(self.written_end);
        }
    }

    /// `value`の下位`width`ビット（最大64）をビッグエンディアンで書き込む。
    ///
    /// 上限付きバッファで上限を超える場合は書き込みエラーとなる。
    pub fn put_bits(&mut self, value: u64, width: usize) {
        if width == 0 {
            return;
        }
        if width > 64 {
            self.write_error = true;
            return;
        }
        let end = self.write_bit + width;
        if let Some(max) = self.max_size {
            if end > max * 8 {
                self.write_error = true;
                return;
            }
        }
        if self.data.len() * 8 < end {
            self.data.resize((end + 7) / 8, 0);
        }

        let value = if width < 64 { value & ((1 << width) - 1) } else { value };
        store(&mut self.data, self.write_bit, value, width);
        self.write_bit = end;
        self.advance_write();
    }

    /// 1ビットを書き込む。
    #[inline]
    pub fn put_bit(&mut self, value: bool) {
        self.put_bits(value as u64, 1);
    }

    /// 8ビット整数を書き込む。
    #[inline]
    pub fn put_u8(&mut self, value: u8) {
        self.put_bits(value as u64, 8);
    }

    /// 16ビット整数をビッグエンディアンで書き込む。
    #[inline]
    pub fn put_u16(&mut self, value: u16) {
        self.put_bits(value as u64, 16);
    }

    /// 32ビット整数をビッグエンディアンで書き込む。
    #[inline]
    pub fn put_u32(&mut self, value: u32) {
        self.put_bits(value as u64, 32);
    }

    /// `bytes`を書き込む。
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        if self.write_bit % 8 == 0 {
            let end = self.write_bit + bytes.len() * 8;
            if let Some(max) = self.max_size {
                if end > max * 8 {
                    self.write_error = true;
                    return;
                }
            }
            if self.data.len() * 8 < end {
                self.data.resize((end + 7) / 8, 0);
            }
            let start = self.write_bit / 8;
            self.data[start..start + bytes.len()].copy_from_slice(bytes);
            self.write_bit = end;
            self.advance_write();
        } else {
            for &b in bytes {
                self.put_bits(b as u64, 8);
            }
        }
    }

    /// 現在の読み書き位置と読み取り上限を保存する。
    ///
    /// 対応する[`BitBuffer::pop_state`]で保存時の状態に復元される。
    pub fn push_state(&mut self) {
        self.states.push(State::Full {
            read_bit: self.read_bit,
            write_bit: self.write_bit,
            read_end: self.read_end,
        });
    }

    /// `width`ビットの長さフィールドを読み取り、その長さ（バイト単位）の
    /// 読み取り領域を作る。
    ///
    /// 対応する[`BitBuffer::pop_state`]までの読み取りはこの領域内に制限される。
    /// 長さが現在の領域を超える場合は読み取りエラーとなり、領域は外側の上限で
    /// 切り詰められる。
    pub fn push_read_length(&mut self, width: usize) {
        let len = self.get_bits(width) as usize;
        let mut end = self.read_bit.saturating_add(len * 8);
        if end > self.read_end {
            self.read_error = true;
            end = self.read_end;
        }

        self.states.push(State::Read {
            outer_end: self.read_end,
        });
        self.read_regions += 1;
        self.read_end = end;
    }

    /// `width`ビット（1～32）の長さフィールドの場所を0で予約し、
    /// 書き込み列を開始する。
    ///
    /// 対応する[`BitBuffer::pop_state`]で、予約位置から先に書き込まれた
    /// バイト数が長さフィールドに埋め戻される。書き込まれた量がバイト境界に
    /// 揃っていない場合やフィールドに収まらない場合は書き込みエラーとなる。
    ///
    /// # パニック
    ///
    /// `width`が範囲外の際はパニックする。
    pub fn push_write_length(&mut self, width: usize) {
        assert!((1..=32).contains(&width));

        let pos = self.write_bit;
        self.put_bits(0, width);
        self.states.push(State::WriteLength { pos, width });
    }

    /// 直近に保存された状態を閉じる。
    ///
    /// # パニック
    ///
    /// 対応するpushがない場合はパニックする。
    pub fn pop_state(&mut self) {
        match self.states.pop().expect("unbalanced pop_state") {
            State::Full {
                read_bit,
                write_bit,
                read_end,
            } => {
                self.read_bit = read_bit;
                self.write_bit = write_bit;
                self.read_end = read_end;
            }
            State::Read { outer_end } => {
                // 領域の残りは読み捨てる
                self.read_bit = self.read_end;
                self.read_end = outer_end;
                self.read_regions -= 1;
            }
            State::WriteLength { pos, width } => {
                let start = pos + width;
                if !self.write_error && self.write_bit >= start {
                    let bits = self.write_bit - start;
                    let bytes = (bits / 8) as u64;
                    if bits % 8 != 0 || (width < 64 && bytes >> width != 0) {
                        self.write_error = true;
                    } else {
                        store(&mut self.data, pos, bytes, width);
                    }
                }
            }
        }
    }

    /// 入れ子の深さを返す。
    #[inline]
    pub fn state_depth(&self) -> usize {
        self.states.len()
    }

    /// 全ての領域が閉じられ、読み取りが終端まで達しているかどうかを返す。
    #[inline]
    pub fn is_fully_consumed(&self) -> bool {
        self.states.is_empty() && self.read_bit == self.read_end
    }

    /// 利用者定義のエラーを記録する。
    #[inline]
    pub fn set_user_error(&mut self) {
        self.user_error = true;
    }

    /// 読み取りエラーが発生しているかどうかを返す。
    #[inline]
    pub fn read_error(&self) -> bool {
        self.read_error
    }

    /// 書き込みエラーが発生しているかどうかを返す。
    #[inline]
    pub fn write_error(&self) -> bool {
        self.write_error
    }

    /// いずれかのエラーが発生しているかどうかを返す。
    #[inline]
    pub fn error(&self) -> bool {
        self.read_error || self.write_error || self.user_error
    }

    /// エラーが発生していないかどうかを返す。
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.error()
    }
}

impl Default for BitBuffer {
    fn default() -> BitBuffer {
        BitBuffer::new()
    }
}

/// `data`の`pos`ビット目から`width`ビットをビッグエンディアンで取り出す。
fn extract(data: &[u8], mut pos: usize, width: usize) -> u64 {
    debug_assert!(width <= 64 && pos + width <= data.len() * 8);

    let mut value = 0u64;
    let mut remaining = width;
    while remaining > 0 {
        let avail = 8 - (pos & 7);
        let take = avail.min(remaining);
        let mask = ((1u16 << take) - 1) as u8;
        let chunk = (data[pos >> 3] >> (avail - take)) & mask;
        value = (value << take) | chunk as u64;
        pos += take;
        remaining -= take;
    }
    value
}

/// `data`の`pos`ビット目から`value`の下位`width`ビットをビッグエンディアンで
/// 書き込む。
fn store(data: &mut [u8], mut pos: usize, value: u64, width: usize) {
    debug_assert!(width <= 64 && pos + width <= data.len() * 8);

    let mut remaining = width;
    while remaining > 0 {
        let avail = 8 - (pos & 7);
        let take = avail.min(remaining);
        let mask = ((1u16 << take) - 1) as u8;
        let chunk = (value >> (remaining - take)) as u8 & mask;
        let shift = avail - take;
        let b = &mut data[pos >> 3];
        *b = (*b & !(mask << shift)) | (chunk << shift);
        pos += take;
        remaining -= take;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_bits() {
        let mut buf = BitBuffer::from_bytes(&[0b1010_0001, 0b0100_0001, 0x12, 0x34, 0x56]);
        assert_eq!(buf.get_bits(1), 1);
        assert_eq!(buf.get_bits(3), 0b010);
        assert_eq!(buf.get_bits(12), 0b0001_0100_0001);
        assert_eq!(buf.get_bits(24), 0x123456);
        assert!(buf.is_fully_consumed());
        assert!(!buf.error());
    }

    #[test]
    fn test_get_scalars() {
        let mut buf = BitBuffer::from_bytes(&[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0]);
        assert_eq!(buf.get_u8(), 0x12);
        assert_eq!(buf.get_u16(), 0x3456);
        assert_eq!(buf.get_u24(), 0x789ABC);
        assert_eq!(buf.get_u16(), 0xDEF0);
        assert!(!buf.error());
    }

    #[test]
    fn test_get_bits_truncated() {
        let mut buf = BitBuffer::from_bytes(&[0xFF]);
        assert_eq!(buf.get_bits(4), 0xF);
        // 残り4ビットしかない
        assert_eq!(buf.get_bits(8), 0);
        assert!(buf.read_error());
        // 以降の読み取りも全て失敗する
        assert_eq!(buf.get_bits(1), 0);
        assert!(!buf.can_read(1));
    }

    #[test]
    fn test_probes() {
        let buf = BitBuffer::from_bytes(&[0x00, 0x00]);
        assert!(buf.can_read(16));
        assert!(!buf.can_read(17));
        assert!(buf.can_read_bytes(2));
        assert!(!buf.can_read_bytes(3));
        // プローブはエラーを立てない
        assert!(!buf.error());
    }

    #[test]
    fn test_get_bytes() {
        let mut buf = BitBuffer::from_bytes(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(buf.get_bytes(2), [0x01, 0x02]);

        // バイト境界を跨いだ読み取り
        let mut buf = BitBuffer::from_bytes(&[0x12, 0x34, 0x56]);
        buf.skip_bits(4);
        assert_eq!(buf.get_bytes(2), [0x23, 0x45]);

        // 足りない場合は0埋めとエラー
        let mut buf = BitBuffer::from_bytes(&[0x01]);
        assert_eq!(buf.get_bytes(2), [0, 0]);
        assert!(buf.read_error());
    }

    #[test]
    fn test_put_bits() {
        let mut buf = BitBuffer::new();
        buf.put_bits(0b101, 3);
        buf.put_bits(0b0_0001, 5);
        buf.put_u16(0x1234);
        assert_eq!(buf.as_bytes(), [0b1010_0001, 0x12, 0x34]);
        assert!(!buf.error());

        // 幅を超える値はマスクされる
        let mut buf = BitBuffer::new();
        buf.put_bits(0x1FF, 8);
        assert_eq!(buf.as_bytes(), [0xFF]);
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut buf = BitBuffer::new();
        buf.put_bits(0x5A5, 12);
        buf.put_bit(true);
        buf.put_bits(0x7FFF_FFFF_FFFF_FFFF, 63);
        buf.put_bytes(&[0xAB, 0xCD]);

        assert_eq!(buf.get_bits(12), 0x5A5);
        assert!(buf.get_bit());
        assert_eq!(buf.get_bits(63), 0x7FFF_FFFF_FFFF_FFFF);
        assert_eq!(buf.get_bytes(2), [0xAB, 0xCD]);
        assert!(buf.is_fully_consumed());
        assert!(!buf.error());
    }

    #[test]
    fn test_bounded_write() {
        let mut buf = BitBuffer::with_max_size(2);
        buf.put_u16(0x1234);
        assert!(!buf.error());
        buf.put_bits(0, 1);
        assert!(buf.write_error());
        assert_eq!(buf.as_bytes(), [0x12, 0x34]);
    }

    #[test]
    fn test_push_read_length() {
        // 8ビット長フィールド（2バイト）＋内容、その後に外側の続き
        let mut buf = BitBuffer::from_bytes(&[0x02, 0xAA, 0xBB, 0xCC]);
        buf.push_read_length(8);
        assert_eq!(buf.remaining_read_bytes(), 2);
        assert_eq!(buf.get_u8(), 0xAA);
        // 領域内で読み取れるのは残り1バイトのみ
        assert!(!buf.can_read_bytes(2));
        buf.pop_state();
        // 読み残しは捨てられ、外側の続きが読める
        assert_eq!(buf.get_u8(), 0xCC);
        assert!(buf.is_fully_consumed());
        assert!(!buf.error());
    }

    #[test]
    fn test_push_read_length_nested() {
        // 外側2バイト領域の中に1バイト領域
        let mut buf = BitBuffer::from_bytes(&[0x03, 0x01, 0xAA, 0xBB, 0xCC]);
        buf.push_read_length(8);
        buf.push_read_length(8);
        assert_eq!(buf.remaining_read_bytes(), 1);
        assert_eq!(buf.get_u8(), 0xAA);
        buf.pop_state();
        assert_eq!(buf.remaining_read_bytes(), 1);
        assert_eq!(buf.get_u8(), 0xBB);
        buf.pop_state();
        assert_eq!(buf.get_u8(), 0xCC);
        assert!(buf.is_fully_consumed());
        assert!(!buf.error());
    }

    #[test]
    fn test_push_read_length_truncated() {
        // 長さフィールドがバッファより大きい値を主張する
        let mut buf = BitBuffer::from_bytes(&[0x10, 0xAA]);
        buf.push_read_length(8);
        assert!(buf.read_error());
        // 領域は外側の上限で切り詰められている
        assert_eq!(buf.remaining_read_bytes(), 1);
        buf.pop_state();
        assert!(buf.error());
    }

    #[test]
    fn test_push_write_length() {
        let mut buf = BitBuffer::new();
        buf.put_u8(0x47);
        buf.push_write_length(8);
        buf.put_bytes(&[0xAA, 0xBB, 0xCC]);
        buf.pop_state();
        buf.put_u8(0x00);
        assert_eq!(buf.as_bytes(), [0x47, 0x03, 0xAA, 0xBB, 0xCC, 0x00]);
        assert!(!buf.error());
    }

    #[test]
    fn test_push_write_length_unaligned_field() {
        // 4ビットのフラグに続く12ビット長フィールド
        let mut buf = BitBuffer::new();
        buf.put_bits(0b1111, 4);
        buf.push_write_length(12);
        buf.put_bytes(&[0x11; 300]);
        buf.pop_state();
        let bytes = buf.as_bytes();
        assert_eq!(bytes[0], 0xF1);
        assert_eq!(bytes[1], 0x2C);
        assert_eq!(bytes.len(), 2 + 300);
        assert!(!buf.error());
    }

    #[test]
    fn test_push_write_length_nested() {
        let mut buf = BitBuffer::new();
        buf.push_write_length(8);
        buf.put_u8(0xAA);
        buf.push_write_length(8);
        buf.put_bytes(&[0xBB, 0xCC]);
        buf.pop_state();
        buf.put_u8(0xDD);
        buf.pop_state();
        // 外側の長さは内側の長さフィールドも含む
        assert_eq!(buf.as_bytes(), [0x05, 0xAA, 0x02, 0xBB, 0xCC, 0xDD]);
        assert!(!buf.error());
    }

    #[test]
    fn test_push_write_length_overflow() {
        // 4ビットの長さフィールドに16バイトは収まらない
        let mut buf = BitBuffer::new();
        buf.put_bits(0, 4);
        buf.push_write_length(4);
        buf.put_bytes(&[0; 16]);
        buf.pop_state();
        assert!(buf.write_error());
    }

    #[test]
    fn test_push_write_length_unaligned_content() {
        let mut buf = BitBuffer::new();
        buf.push_write_length(8);
        buf.put_bits(0, 4);
        buf.pop_state();
        assert!(buf.write_error());
    }

    #[test]
    fn test_push_state() {
        let mut buf = BitBuffer::from_bytes(&[0x12, 0x34]);
        buf.push_state();
        assert_eq!(buf.get_u16(), 0x1234);
        buf.pop_state();
        assert_eq!(buf.get_u8(), 0x12);
        assert!(!buf.error());
    }

    #[test]
    fn test_pop_state_unbalanced() {
        let mut buf = BitBuffer::new();
        std::panic::catch_unwind(move || buf.pop_state()).unwrap_err();
    }

    #[test]
    fn test_seek() {
        let mut buf = BitBuffer::from_bytes(&[0x12, 0x34, 0x56]);
        buf.read_seek(8);
        assert_eq!(buf.get_u8(), 0x34);
        buf.read_seek(100);
        assert!(buf.read_error());

        let mut buf = BitBuffer::from_bytes(&[0x12, 0x34, 0x56]);
        buf.write_seek(8);
        buf.put_u8(0xFF);
        assert_eq!(buf.as_bytes(), [0x12, 0xFF, 0x56]);
        assert!(!buf.error());
        buf.write_seek(100);
        assert!(buf.write_error());
    }

    #[test]
    fn test_user_error() {
        let mut buf = BitBuffer::new();
        assert!(buf.is_valid());
        buf.set_user_error();
        assert!(buf.error());
        assert!(!buf.read_error());
        assert!(!buf.write_error());
    }

    #[test]
    fn test_deep_nesting() {
        // 深い入れ子でも正しく埋め戻される
        let depth = 100;
        let mut buf = BitBuffer::new();
        for _ in 0..depth {
            buf.push_write_length(16);
        }
        buf.put_u8(0xEE);
        for _ in 0..depth {
            buf.pop_state();
        }
        assert!(!buf.error());
        assert_eq!(buf.state_depth(), 0);

        let mut buf = BitBuffer::from_vec(buf.into_vec());
        for i in (0..depth).rev() {
            buf.push_read_length(16);
            assert_eq!(buf.remaining_read_bytes(), i * 2 + 1);
        }
        assert_eq!(buf.get_u8(), 0xEE);
        for _ in 0..depth {
            buf.pop_state();
        }
        assert!(buf.is_fully_consumed());
        assert!(!buf.error());
    }
}
