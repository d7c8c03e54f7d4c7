use super::{check_read_len, NvIndex, NvStore, Result, TpmError};
use crate::command::{Output, Tool};
use crate::config::ToolPaths;
use zeroize::Zeroizing;

/// NV storage through the tpm2-tools command line utilities, the same ones
/// the keyscript uses at boot.
#[derive(Debug, Clone)]
pub struct Tpm2Tools {
    nvreadpublic: Tool,
    nvundefine: Tool,
    nvdefine: Tool,
    nvwrite: Tool,
    nvread: Tool,
}

fn expect_success(tool: &Tool, out: Output) -> Result<Output> {
    if out.success() {
        return Ok(out);
    }
    Err(TpmError::Tool {
        tool: tool.binary().to_path_buf(),
        message: out.diagnostic(),
    })
}

impl Tpm2Tools {
    pub fn new(paths: &ToolPaths) -> Self {
        Self {
            nvreadpublic: Tool::new(&paths.tpm2_nvreadpublic),
            nvundefine: Tool::new(&paths.tpm2_nvundefine),
            nvdefine: Tool::new(&paths.tpm2_nvdefine),
            nvwrite: Tool::new(&paths.tpm2_nvwrite),
            nvread: Tool::new(&paths.tpm2_nvread),
        }
    }

    fn is_defined(&self, index: NvIndex) -> Result<bool> {
        let out = self.nvreadpublic.output([index.to_string()], None)?;
        Ok(out.success())
    }
}

impl NvStore for Tpm2Tools {
    fn undefine_if_present(&mut self, index: NvIndex) -> Result<bool> {
        if !self.is_defined(index)? {
            return Ok(false);
        }
        let out = self
            .nvundefine
            .output(["-C".to_string(), "o".to_string(), index.to_string()], None)?;
        expect_success(&self.nvundefine, out)?;
        Ok(true)
    }

    fn define(&mut self, index: NvIndex, size: u16) -> Result<()> {
        let args = [
            "-C".to_string(),
            "o".to_string(),
            "-s".to_string(),
            size.to_string(),
            index.to_string(),
        ];
        let out = self.nvdefine.output(args, None)?;
        expect_success(&self.nvdefine, out)?;
        Ok(())
    }

    fn write(&mut self, index: NvIndex, data: &[u8]) -> Result<()> {
        let args = [
            "-C".to_string(),
            "o".to_string(),
            "-i".to_string(),
            "-".to_string(),
            index.to_string(),
        ];
        let out = self.nvwrite.output(args, Some(data))?;
        expect_success(&self.nvwrite, out)?;
        Ok(())
    }

    fn read(&mut self, index: NvIndex, size: u16) -> Result<Zeroizing<Vec<u8>>> {
        let args = [
            "-C".to_string(),
            "o".to_string(),
            "-s".to_string(),
            size.to_string(),
            index.to_string(),
        ];
        let out = self.nvread.output(args, None)?;
        let out = expect_success(&self.nvread, out)?;
        let data = Zeroizing::new(out.stdout);
        check_read_len(index, size, &data)?;
        Ok(data)
    }
}
