use super::{check_read_len, NvIndex, NvStore, Result, TpmError};
use once_cell::sync::OnceCell;
use std::sync::{Mutex, MutexGuard};
use tss_esapi::abstraction::nv;
use tss_esapi::constants::property_tag::PropertyTag;
use tss_esapi::attributes::NvIndexAttributesBuilder;
use tss_esapi::handles::{NvIndexHandle, NvIndexTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::resource_handles::{NvAuth, Provision};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{MaxNvBuffer, NvPublicBuilder};
use tss_esapi::tcti_ldr::TctiNameConf;

pub type Context = MutexGuard<'static, tss_esapi::Context>;

/// Used when the TPM does not report `TPM_PT_NV_BUFFER_MAX`.
const DEFAULT_NV_BUFFER_MAX: u16 = 512;

static CONTEXT: OnceCell<Mutex<tss_esapi::Context>> = OnceCell::new();

/// Connects on first use, with the TCTI taken from the `TCTI` environment
/// variable (set from `--tcti`).
fn get_context() -> Result<Context> {
    let context = CONTEXT.get_or_try_init(|| {
        let conf = TctiNameConf::from_environment_variable()
            .map_err(|err| TpmError::Context(format!("invalid TCTI config: {err}")))?;
        log::debug!("TCTI config {:?}", conf);
        let context = tss_esapi::Context::new(conf)
            .map_err(|err| TpmError::Context(err.to_string()))?;
        Ok::<_, TpmError>(Mutex::new(context))
    })?;
    context.lock().map_err(|_| TpmError::ContextPoisoned)
}

fn tpm_handle(index: NvIndex) -> Result<NvIndexTpmHandle> {
    Ok(NvIndexTpmHandle::new(index.value())?)
}

/// ESYS handle for an NV index that is already defined.
fn nv_handle(ctx: &mut tss_esapi::Context, index: NvIndex) -> Result<NvIndexHandle> {
    let handle = tpm_handle(index)?;
    let object =
        ctx.execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::NvIndex(handle)))?;
    Ok(object.into())
}

/// Largest NV read or write the TPM accepts in one command.
fn nv_buffer_max(ctx: &mut tss_esapi::Context) -> u16 {
    match ctx.get_tpm_property(PropertyTag::NvBufferMax) {
        Ok(Some(max)) if max > 0 => u16::try_from(max).unwrap_or(u16::MAX),
        other => {
            log::debug!("No usable NV buffer size ({other:?}), using {DEFAULT_NV_BUFFER_MAX}");
            DEFAULT_NV_BUFFER_MAX
        }
    }
}

/// `(offset, size)` pieces covering `len` bytes, none larger than `max`.
fn chunks(len: u16, max: u16) -> Vec<(u16, u16)> {
    let max = max.max(1);
    (0..len)
        .step_by(max.into())
        .map(|offset| (offset, (len - offset).min(max)))
        .collect()
}

/// NV storage through the TSS2 ESAPI, authorised as the owner hierarchy with
/// an empty password.
#[derive(Debug, Default)]
pub struct EsapiNvStore;

impl EsapiNvStore {
    pub fn new() -> Self {
        Self
    }

    fn is_defined(ctx: &mut tss_esapi::Context, index: NvIndex) -> Result<bool> {
        Ok(nv::list(ctx)?
            .iter()
            .any(|(public, _)| u32::from(public.nv_index()) == index.value()))
    }
}

impl NvStore for EsapiNvStore {
    fn undefine_if_present(&mut self, index: NvIndex) -> Result<bool> {
        let mut ctx = get_context()?;
        if !Self::is_defined(&mut ctx, index)? {
            return Ok(false);
        }
        let handle = nv_handle(&mut ctx, index)?;
        ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.nv_undefine_space(Provision::Owner, handle)
        })?;
        Ok(true)
    }

    fn define(&mut self, index: NvIndex, size: u16) -> Result<()> {
        let mut ctx = get_context()?;
        // Same attributes tpm2_nvdefine applies by default, so tpm2_nvread in
        // the initramfs can read the index with owner auth.
        let attributes = NvIndexAttributesBuilder::new()
            .with_owner_write(true)
            .with_owner_read(true)
            .with_auth_write(true)
            .with_auth_read(true)
            .build()?;
        let public = NvPublicBuilder::new()
            .with_nv_index(tpm_handle(index)?)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_data_area_size(size.into())
            .build()?;
        ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.nv_define_space(Provision::Owner, None, public)
        })?;
        Ok(())
    }

    fn write(&mut self, index: NvIndex, data: &[u8]) -> Result<()> {
        let len = u16::try_from(data.len()).map_err(|_| TpmError::TooLarge(data.len()))?;
        let mut ctx = get_context()?;
        let handle = nv_handle(&mut ctx, index)?;
        let max = nv_buffer_max(&mut ctx);
        for (offset, size) in chunks(len, max) {
            let start = usize::from(offset);
            let buffer = MaxNvBuffer::try_from(data[start..start + usize::from(size)].to_vec())?;
            ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_write(NvAuth::Owner, handle, buffer, offset)
            })?;
        }
        Ok(())
    }

    fn read(&mut self, index: NvIndex, size: u16) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        let mut ctx = get_context()?;
        let handle = nv_handle(&mut ctx, index)?;
        let max = nv_buffer_max(&mut ctx);
        let mut data = zeroize::Zeroizing::new(Vec::with_capacity(size.into()));
        for (offset, len) in chunks(size, max) {
            let buffer = ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_read(NvAuth::Owner, handle, len, offset)
            })?;
            data.extend_from_slice(buffer.value());
        }
        check_read_len(index, size, &data)?;
        Ok(data)
    }
}
