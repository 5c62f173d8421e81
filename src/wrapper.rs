//! remux/src/wrapper.rs
//! Composable stream wrappers applied around a tunnel connection: ciphers,
//! padding and compression. A `WrapperChain` stacks several wrappers
//! innermost-first for writes and unwinds them outermost-first for reads. The
//! chain's description travels with the connection as a base64, AES-CBC
//! encrypted, YAML document so both peers agree on what to strip.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::Aes256;
use aes::cipher::{KeyIvInit, StreamCipher};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut};
use ctr::Ctr128BE;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

use crate::error::{RemuxError, Result};
use crate::tunnel::BoxedStream;

const PUMP_CHUNK: usize = 16 * 1024;
const PUMP_BUFFER: usize = 64 * 1024;

type Aes256Ctr = Ctr128BE<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// A named, independently (de)registerable stream transform.
pub trait Wrapper: AsyncRead + AsyncWrite + Send + Unpin {
    fn name(&self) -> &'static str;
}

/// One entry in a serialized wrapper chain description.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WrapperOption {
    pub name: String,
    pub options: HashMap<String, String>,
}

pub type WrapperOptions = Vec<WrapperOption>;

/// Decrypts and parses a chain description: base64 -> AES-256-CBC (PKCS7,
/// key-derived IV) -> YAML.
pub fn parse_wrapper_options(s: &str, key: &[u8]) -> Result<WrapperOptions> {
    let cipher_bytes = BASE64
        .decode(s.trim())
        .map_err(|e| RemuxError::Crypto(e.to_string()))?;
    let (iv, ciphertext) = split_iv(&cipher_bytes)?;
    let key32 = derive_key32(key);
    let mut buf = ciphertext.to_vec();
    let dec = Aes256CbcDec::new(&key32.into(), iv.into());
    let plain = dec
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| RemuxError::Crypto(e.to_string()))?;
    serde_yaml::from_slice(plain).map_err(|e| RemuxError::Unmarshal(e.to_string()))
}

/// Serializes a chain description: YAML -> AES-256-CBC (PKCS7, random IV) ->
/// base64, with the IV prepended to the ciphertext.
pub fn wrapper_options_to_string(opts: &WrapperOptions, key: &[u8]) -> Result<String> {
    let yaml = serde_yaml::to_string(opts).map_err(|e| RemuxError::Marshal(e.to_string()))?;
    let key32 = derive_key32(key);
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    let enc = Aes256CbcEnc::new(&key32.into(), &iv.into());
    let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(yaml.as_bytes());
    let mut out = Vec::with_capacity(16 + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

fn split_iv(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    if bytes.len() < 16 {
        return Err(RemuxError::Crypto("ciphertext shorter than one IV block".into()));
    }
    Ok(bytes.split_at(16))
}

fn derive_key32(key: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, b) in key.iter().cycle().take(32).enumerate() {
        out[i] = *b;
    }
    out
}

fn derive_iv16(key: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let n = key.len().min(16);
    out[..n].copy_from_slice(&key[..n]);
    out
}

/// Generates `count` (between `min` and `max`) randomly configured wrappers,
/// chosen from the AES/XOR/padding set, in a shuffled order.
pub fn generate_random_wrapper_options(min: usize, max: usize) -> WrapperOptions {
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    let count = if max > min { min + (rng.next_u32() as usize % (max - min + 1)) } else { min };
    let mut pool = vec!["aes", "xor", "padding"];
    pool.shuffle(&mut rng);
    let mut chosen = Vec::new();
    for i in 0..count {
        let name = pool[i % pool.len()];
        let mut options = HashMap::new();
        match name {
            "aes" => {
                options.insert("key".into(), random_string(32));
            }
            "xor" => {
                options.insert("key".into(), random_string(16));
            }
            "padding" => {
                options.insert("prefix".into(), random_string(4));
                options.insert("suffix".into(), random_string(4));
            }
            _ => {}
        }
        chosen.push(WrapperOption { name: name.to_string(), options });
    }
    chosen
}

fn random_string(len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[(rng.next_u32() as usize) % CHARS.len()] as char)
        .collect()
}

/// AES-256-CTR stream cipher wrapper. `Close` re-derives fresh ciphers from
/// the same key/iv rather than tearing anything down, matching the
/// reset-not-release semantics the chain relies on when a wrapper is reused.
pub struct AesCtrWrapper<S> {
    inner: S,
    enc: Aes256Ctr,
    dec: Aes256Ctr,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AesCtrWrapper<S> {
    pub fn new(inner: S, key: &[u8]) -> AesCtrWrapper<S> {
        let key32 = derive_key32(key);
        let iv16 = derive_iv16(key);
        AesCtrWrapper {
            inner,
            enc: Aes256Ctr::new(&key32.into(), &iv16.into()),
            dec: Aes256Ctr::new(&key32.into(), &iv16.into()),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AesCtrWrapper<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let start = buf.filled().len();
        let inner = Pin::new(&mut self.inner);
        let res = inner.poll_read(cx, buf);
        if res.is_ready() {
            self.dec.apply_keystream(&mut buf.filled_mut()[start..]);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AesCtrWrapper<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut out = data.to_vec();
        self.enc.apply_keystream(&mut out);
        Pin::new(&mut self.inner).poll_write(cx, &out)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> Wrapper for AesCtrWrapper<S> {
    fn name(&self) -> &'static str {
        "aes"
    }
}

/// Hand-rolled XOR keystream wrapper; no cryptographic strength, used purely
/// for lightweight obfuscation in a chain.
pub struct XorWrapper<S> {
    inner: S,
    key: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl<S> XorWrapper<S> {
    pub fn new(inner: S, key: &[u8]) -> XorWrapper<S> {
        XorWrapper { inner, key: key.to_vec(), read_pos: 0, write_pos: 0 }
    }

    fn xor(&mut self, data: &mut [u8], pos: &mut usize) {
        if self.key.is_empty() {
            return;
        }
        for b in data.iter_mut() {
            *b ^= self.key[*pos % self.key.len()];
            *pos += 1;
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for XorWrapper<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let start = buf.filled().len();
        let inner = Pin::new(&mut self.inner);
        let res = inner.poll_read(cx, buf);
        if res.is_ready() {
            let mut pos = self.read_pos;
            self.xor(&mut buf.filled_mut()[start..], &mut pos);
            self.read_pos = pos;
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for XorWrapper<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut out = data.to_vec();
        let mut pos = self.write_pos;
        self.xor(&mut out, &mut pos);
        self.write_pos = pos;
        Pin::new(&mut self.inner).poll_write(cx, &out)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> Wrapper for XorWrapper<S> {
    fn name(&self) -> &'static str {
        "xor"
    }
}

/// Frames each write as `prefix | length:u32-le | payload | suffix` and
/// strips the same framing on read, so a passive observer sees fixed marker
/// bytes around otherwise-opaque chunks. Low-level framer used by
/// `PaddingWrapper` to do the actual byte shuffling.
pub struct PaddingFramer<S> {
    inner: S,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PaddingFramer<S> {
    pub fn new(inner: S, prefix: Vec<u8>, suffix: Vec<u8>) -> PaddingFramer<S> {
        PaddingFramer { inner, prefix, suffix, pending: Vec::new(), pending_pos: 0 }
    }

    async fn fill(&mut self) -> Result<()> {
        self.pending = read_padded_frame(&mut self.inner, &self.prefix, &self.suffix).await?;
        self.pending_pos = 0;
        Ok(())
    }

    pub async fn read_framed(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending_pos >= self.pending.len() {
            self.fill().await?;
        }
        let remaining = &self.pending[self.pending_pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pending_pos += n;
        Ok(n)
    }

    pub async fn write_framed(&mut self, data: &[u8]) -> Result<()> {
        write_padded_frame(&mut self.inner, &self.prefix, &self.suffix, data).await
    }
}

async fn write_padded_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    prefix: &[u8],
    suffix: &[u8],
    data: &[u8],
) -> Result<()> {
    let mut frame = Vec::with_capacity(prefix.len() + 4 + data.len() + suffix.len());
    frame.extend_from_slice(prefix);
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(data);
    frame.extend_from_slice(suffix);
    w.write_all(&frame).await?;
    Ok(())
}

async fn read_padded_frame<R: AsyncRead + Unpin>(r: &mut R, prefix: &[u8], suffix: &[u8]) -> Result<Vec<u8>> {
    if !prefix.is_empty() {
        let mut marker = vec![0u8; prefix.len()];
        r.read_exact(&mut marker).await?;
        if marker != prefix {
            return Err(RemuxError::Unmarshal("padding prefix mismatch".into()));
        }
    }
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let length = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; length];
    r.read_exact(&mut payload).await?;
    if !suffix.is_empty() {
        let mut marker = vec![0u8; suffix.len()];
        r.read_exact(&mut marker).await?;
        if marker != suffix {
            return Err(RemuxError::Unmarshal("padding suffix mismatch".into()));
        }
    }
    Ok(payload)
}

/// `Wrapper`-conformant padding layer: an independent duplex pipe fronts the
/// caller, while a spawned pump task frames/deframes against the real
/// connection through a `PaddingFramer`, so this can be boxed and stacked
/// into a `WrapperChain` alongside the cipher wrappers above.
pub struct PaddingWrapper {
    front: DuplexStream,
}

impl PaddingWrapper {
    pub fn new<S>(inner: S, prefix: Vec<u8>, suffix: Vec<u8>) -> PaddingWrapper
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (front, back) = tokio::io::duplex(PUMP_BUFFER);
        tokio::spawn(padding_pump(inner, back, prefix, suffix));
        PaddingWrapper { front }
    }
}

async fn padding_pump<S>(inner: S, back: DuplexStream, prefix: Vec<u8>, suffix: Vec<u8>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut inner_r, mut inner_w) = tokio::io::split(inner);
    let (mut back_r, mut back_w) = tokio::io::split(back);
    let to_wire = async {
        let mut buf = vec![0u8; PUMP_CHUNK];
        loop {
            let n = back_r.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            write_padded_frame(&mut inner_w, &prefix, &suffix, &buf[..n]).await?;
        }
        Ok::<(), RemuxError>(())
    };
    let from_wire = async {
        loop {
            let payload = read_padded_frame(&mut inner_r, &prefix, &suffix).await?;
            back_w.write_all(&payload).await?;
        }
        #[allow(unreachable_code)]
        Ok::<(), RemuxError>(())
    };
    let _ = tokio::join!(to_wire, from_wire);
}

impl AsyncRead for PaddingWrapper {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().front).poll_read(cx, buf)
    }
}

impl AsyncWrite for PaddingWrapper {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().front).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().front).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().front).poll_shutdown(cx)
    }
}

impl Wrapper for PaddingWrapper {
    fn name(&self) -> &'static str {
        "padding"
    }
}

/// Thin async adapter around the `snap` frame format, for use as a chain
/// member when bandwidth matters more than CPU. Low-level framer used by
/// `SnappyWrapper` to do the actual compress/decompress work.
pub struct SnappyFramer<S> {
    inner: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SnappyFramer<S> {
    pub fn new(inner: S) -> SnappyFramer<S> {
        SnappyFramer { inner }
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        write_snappy_frame(&mut self.inner, data).await
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        read_snappy_frame(&mut self.inner).await
    }
}

async fn write_snappy_frame<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    let mut encoder = snap::raw::Encoder::new();
    let compressed = encoder
        .compress_vec(data)
        .map_err(|e| RemuxError::Crypto(e.to_string()))?;
    let len = (compressed.len() as u32).to_le_bytes();
    w.write_all(&len).await?;
    w.write_all(&compressed).await?;
    Ok(())
}

async fn read_snappy_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut compressed = vec![0u8; len];
    r.read_exact(&mut compressed).await?;
    let mut decoder = snap::raw::Decoder::new();
    decoder
        .decompress_vec(&compressed)
        .map_err(|e| RemuxError::Crypto(e.to_string()))
}

/// `Wrapper`-conformant compression layer, built the same way as
/// `PaddingWrapper`: a duplex pipe fronts the caller while a spawned pump
/// frames/compresses against the real connection.
pub struct SnappyWrapper {
    front: DuplexStream,
}

impl SnappyWrapper {
    pub fn new<S>(inner: S) -> SnappyWrapper
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (front, back) = tokio::io::duplex(PUMP_BUFFER);
        tokio::spawn(snappy_pump(inner, back));
        SnappyWrapper { front }
    }
}

async fn snappy_pump<S>(inner: S, back: DuplexStream)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut inner_r, mut inner_w) = tokio::io::split(inner);
    let (mut back_r, mut back_w) = tokio::io::split(back);
    let to_wire = async {
        let mut buf = vec![0u8; PUMP_CHUNK];
        loop {
            let n = back_r.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            write_snappy_frame(&mut inner_w, &buf[..n]).await?;
        }
        Ok::<(), RemuxError>(())
    };
    let from_wire = async {
        loop {
            let payload = read_snappy_frame(&mut inner_r).await?;
            back_w.write_all(&payload).await?;
        }
        #[allow(unreachable_code)]
        Ok::<(), RemuxError>(())
    };
    let _ = tokio::join!(to_wire, from_wire);
}

impl AsyncRead for SnappyWrapper {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().front).poll_read(cx, buf)
    }
}

impl AsyncWrite for SnappyWrapper {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().front).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().front).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().front).poll_shutdown(cx)
    }
}

impl Wrapper for SnappyWrapper {
    fn name(&self) -> &'static str {
        "snappy"
    }
}

/// Stacks wrappers from a parsed chain description around `inner`. The first
/// option becomes the innermost layer (closest to the raw stream), the last
/// becomes outermost (closest to the caller) — so a write traverses
/// innermost to outermost and a read unwinds outermost to innermost.
pub struct WrapperChain {
    stream: BoxedStream,
    names: Vec<&'static str>,
}

impl WrapperChain {
    pub fn build(inner: BoxedStream, options: &WrapperOptions, key: &[u8]) -> Result<WrapperChain> {
        let mut stream = inner;
        let mut names = Vec::with_capacity(options.len());
        for opt in options {
            let (wrapped, name): (BoxedStream, &'static str) = match opt.name.as_str() {
                "aes" => {
                    let wrapper_key = opt.options.get("key").map(String::as_bytes).unwrap_or(key);
                    (Box::pin(AesCtrWrapper::new(stream, wrapper_key)), "aes")
                }
                "xor" => {
                    let wrapper_key = opt.options.get("key").map(String::as_bytes).unwrap_or(key);
                    (Box::pin(XorWrapper::new(stream, wrapper_key)), "xor")
                }
                "padding" => {
                    let prefix = opt.options.get("prefix").map(|s| s.as_bytes().to_vec()).unwrap_or_default();
                    let suffix = opt.options.get("suffix").map(|s| s.as_bytes().to_vec()).unwrap_or_default();
                    (Box::pin(PaddingWrapper::new(stream, prefix, suffix)), "padding")
                }
                "snappy" | "compress" => (Box::pin(SnappyWrapper::new(stream)), "snappy"),
                other => {
                    return Err(RemuxError::NotRegistered { kind: "wrapper", name: other.to_string() });
                }
            };
            stream = wrapped;
            names.push(name);
        }
        Ok(WrapperChain { stream, names })
    }

    pub fn layer_names(&self) -> &[&'static str] {
        &self.names
    }

    pub fn into_inner(self) -> BoxedStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_wrapper_options_respect_count_bounds() {
        let opts = generate_random_wrapper_options(2, 4);
        assert!(opts.len() >= 2 && opts.len() <= 4);
    }

    #[test]
    fn wrapper_options_round_trip_through_encryption() {
        let key = b"0123456789abcdef0123456789abcdef";
        let opts = vec![WrapperOption {
            name: "aes".into(),
            options: HashMap::from([("key".to_string(), "secret".to_string())]),
        }];
        let encoded = wrapper_options_to_string(&opts, key).unwrap();
        let decoded = parse_wrapper_options(&encoded, key).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "aes");
    }

    #[tokio::test]
    async fn aes_ctr_wrapper_round_trips_data() {
        let (a, b) = tokio::io::duplex(4096);
        let key = b"0123456789abcdef0123456789abcdef";
        let mut writer = AesCtrWrapper::new(a, key);
        let mut reader = AesCtrWrapper::new(b, key);
        writer.write_all(b"hello wrapper").await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = [0u8; 13];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello wrapper");
    }

    #[tokio::test]
    async fn xor_wrapper_round_trips_data() {
        let (a, b) = tokio::io::duplex(4096);
        let key = b"shared-secret";
        let mut writer = XorWrapper::new(a, key);
        let mut reader = XorWrapper::new(b, key);
        writer.write_all(b"xor me please").await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = [0u8; 13];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"xor me please");
    }

    #[tokio::test]
    async fn padding_framer_round_trips_framed_payload() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = PaddingFramer::new(a, b"PRE".to_vec(), b"FIX".to_vec());
        let mut reader = PaddingFramer::new(b, b"PRE".to_vec(), b"FIX".to_vec());
        writer.write_framed(b"payload bytes").await.unwrap();
        let mut buf = [0u8; 13];
        let n = reader.read_framed(&mut buf).await.unwrap();
        assert_eq!(n, 13);
        assert_eq!(&buf, b"payload bytes");
    }

    #[tokio::test]
    async fn padding_wrapper_round_trips_as_a_plain_stream() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = PaddingWrapper::new(a, b"PRE".to_vec(), b"FIX".to_vec());
        let mut reader = PaddingWrapper::new(b, b"PRE".to_vec(), b"FIX".to_vec());
        writer.write_all(b"hello padded").await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = [0u8; 12];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello padded");
    }

    #[tokio::test]
    async fn snappy_wrapper_round_trips_as_a_plain_stream() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = SnappyWrapper::new(a);
        let mut reader = SnappyWrapper::new(b);
        writer.write_all(b"hello compressed").await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = [0u8; 17];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello compressed");
    }

    #[tokio::test]
    async fn wrapper_chain_builds_innermost_first_and_round_trips() {
        let (a, b) = tokio::io::duplex(8192);
        let key = b"0123456789abcdef0123456789abcdef";
        let opts = vec![
            WrapperOption { name: "xor".into(), options: HashMap::from([("key".to_string(), "k".to_string())]) },
            WrapperOption { name: "aes".into(), options: HashMap::new() },
        ];
        let mut writer = WrapperChain::build(Box::pin(a), &opts, key).unwrap().into_inner();
        let mut reader = WrapperChain::build(Box::pin(b), &opts, key).unwrap().into_inner();
        writer.write_all(b"chained bytes").await.unwrap();
        writer.flush().await.unwrap();
        let mut buf = [0u8; 13];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"chained bytes");
    }
}
